//! Background refunds. A refund outlives the request that triggered it:
//! entries live in this subsystem-owned registry until their merchant
//! call completes, and shutdown reports any still in flight.

use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use anastasis_core::{Amount, PaymentSecret, TruthUuid};
use anastasis_db::AnastasisDb;
use anastasis_merchant::MerchantClient;

pub struct RefundWorker {
    tasks: Mutex<Vec<(String, tokio::task::JoinHandle<()>)>>,
}

impl RefundWorker {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start refunding the full challenge cost for a failed challenge.
    pub fn begin_refund(
        &self,
        merchant: MerchantClient,
        db: Arc<AnastasisDb>,
        uuid: TruthUuid,
        payment: PaymentSecret,
        amount: Amount,
    ) {
        let order_id = payment.to_string();
        info!(order_id = %order_id, uuid = %uuid.short(),
              "challenge failed, beginning refund");
        let label = order_id.clone();
        let handle = tokio::spawn(async move {
            match merchant
                .refund_order(&order_id, &amount, "failed to issue challenge")
                .await
            {
                Ok(()) => match db.record_challenge_refund(&uuid, &payment) {
                    Ok(true) => info!(order_id = %order_id, "refund recorded"),
                    Ok(false) => info!(order_id = %order_id, "refund was already recorded"),
                    Err(e) => error!(order_id = %order_id, error = %e,
                                     "failed to record refund"),
                },
                Err(e) => {
                    error!(order_id = %order_id, error = %e, "refund failed");
                }
            }
        });
        let mut tasks = self.tasks.lock().expect("refund registry poisoned");
        tasks.retain(|(_, h)| !h.is_finished());
        tasks.push((label, handle));
    }

    /// Abort outstanding refunds; called on shutdown.
    pub fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("refund registry poisoned"));
        for (order_id, handle) in tasks {
            if !handle.is_finished() {
                warn!(order_id = %order_id, "refund aborted by shutdown");
                handle.abort();
            }
        }
    }
}

impl Default for RefundWorker {
    fn default() -> Self {
        Self::new()
    }
}
