use std::io;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::model::Event;
use crate::wal::Wal;

pub(super) type Ack = oneshot::Sender<io::Result<()>>;

pub(super) enum WalCommand {
    Append { event: Event, response: Ack },
    Rewrite { events: Vec<Event>, response: Ack },
}

/// Owns the WAL. Appends that arrive while a flush is pending are folded
/// into the next batch, so N concurrent commits cost one fsync.
pub(super) async fn run(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut pending: Option<WalCommand> = None;
    loop {
        let cmd = match pending.take() {
            Some(cmd) => cmd,
            None => match rx.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { event, response } => batch.push((event, response)),
                        other => {
                            pending = Some(other);
                            break;
                        }
                    }
                }
                commit(&mut wal, batch);
            }
            WalCommand::Rewrite { events, response } => {
                let _ = response.send(wal.rewrite(&events));
            }
        }
    }
    tracing::debug!("wal writer for {} stopped", wal.path().display());
}

fn commit(wal: &mut Wal, batch: Vec<(Event, Ack)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so a half-written batch never leaks into the next one.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, ack) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = ack.send(reply);
    }
}
