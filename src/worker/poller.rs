use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::instance::Instance;
use crate::messages::Stage;

/// Background heartbeat asserting ongoing ownership of an operation at a
/// given stage.
///
/// Every period it calls `poll_operation`; a false return means the queue
/// has disowned the operation and the poller exits on its own. `stop`
/// wakes the poller immediately and joins it, so no poll is issued after
/// `stop` returns.
pub struct OperationPoller {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl OperationPoller {
    pub fn start(
        instance: Arc<dyn Instance>,
        operation_name: String,
        stage: Stage,
        period: Duration,
    ) -> Self {
        let token = CancellationToken::new();
        let poll_token = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = poll_token.cancelled() => break,
                    _ = tokio::time::sleep(period) => {
                        let owned = instance
                            .poll_operation(&operation_name, stage)
                            .await
                            .unwrap_or(false);
                        if !owned {
                            tracing::info!(
                                operation = %operation_name,
                                stage = %stage,
                                "Queue disowned operation, poller exiting"
                            );
                            break;
                        }
                    }
                }
            }
        });
        Self { token, handle }
    }

    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}
