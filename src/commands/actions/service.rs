use std::io::BufRead;

use log::{debug, info, warn};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    error::Result,
    matrix::{MessageHandler, ProtocolClient, SessionManager},
};

/// Keeps the session syncing until Ctrl-C or an unrecoverable failure.
///
/// With `read_confirmations`, every line of the standard input is the ID of a
/// verification transaction to confirm.
pub async fn service<C: ProtocolClient, H: MessageHandler>(
    session: &mut SessionManager<C, H>,
    read_confirmations: bool,
) -> Result<()> {
    let close_handle = session.close_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, stopping");
            close_handle.close();
        }
    });

    if read_confirmations {
        let confirmations = session.confirmation_sender();
        // A blocking read of stdin cannot be cancelled, keep it off the runtime
        std::thread::spawn(move || forward_confirmations(std::io::stdin().lock(), &confirmations));
    }

    let result = session.enter_loop().await;
    interrupt.abort();
    result
}

/// Sends the non-empty lines of `input` as transaction IDs, until `input` ends.
fn forward_confirmations<R: BufRead>(input: R, confirmations: &UnboundedSender<String>) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("cannot read verification confirmations: {}", e);
                return;
            }
        };
        let transaction_id = line.trim();
        if transaction_id.is_empty() {
            continue;
        }
        if confirmations.send(transaction_id.to_owned()).is_err() {
            return;
        }
    }
    debug!("no more verification confirmations");
}
