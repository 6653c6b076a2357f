//! Background acknowledgment pacer.
//!
//! The read path moves the ack cursor but only sends when it has a reason
//! to; this task makes sure the peer still sees acknowledgments advance.
//! It wakes on a jittered interval, compares the cursor against the last
//! value it acked, and emits a bare ACK on change. The first injection
//! error ends the task; whatever went wrong will resurface on the next
//! caller-initiated send.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::dial::ConnShared;

pub(crate) fn spawn(shared: Arc<Mutex<ConnShared>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut acked = shared.lock().await.tpl.layers.tcp.ack;
        loop {
            let interval = rand::thread_rng().gen_range(50..100);
            tokio::time::sleep(Duration::from_millis(interval)).await;

            let mut guard = shared.lock().await;
            if guard.tpl.layers.tcp.ack == acked {
                continue;
            }
            acked = guard.tpl.layers.tcp.ack;
            let ConnShared { tpl, tx, .. } = &mut *guard;
            if let Err(e) = tx.send_ack(tpl) {
                debug!("ack pacer exiting: {e}");
                break;
            }
        }
    })
}
