use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{EventBus, LogLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stream {
    Stdout,
    Stderr,
}

/// Level of a broker log line. Kafka's log4j layout puts the level between
/// spaces (`[2024-01-01 10:00:00,000] WARN ...`).
pub(crate) fn classify_line(line: &str, stream: Stream) -> LogLevel {
    if line.contains(" ERROR ") || line.contains(" FATAL ") {
        LogLevel::Error
    } else if line.contains(" WARN ") {
        LogLevel::Warn
    } else if line.contains(" DEBUG ") || line.contains(" TRACE ") {
        LogLevel::Debug
    } else {
        match stream {
            Stream::Stdout => LogLevel::Info,
            Stream::Stderr => LogLevel::Warn,
        }
    }
}

/// Forward every line of `reader` to the bus as a log event from `source`,
/// until EOF or `cancel` fires.
pub(crate) fn spawn_line_reader<R>(
    reader: R,
    stream: Stream,
    source: &'static str,
    bus: EventBus,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(256);

        loop {
            buf.clear();
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = reader.read_until(b'\n', &mut buf) => read,
            };

            match read {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\r', '\n']);
                    if line.is_empty() {
                        continue;
                    }
                    bus.log(classify_line(line, stream), source, line);
                }
                Err(e) => {
                    warn!("Reading {} {:?} failed: {}", source, stream, e);
                    break;
                }
            }
        }
        debug!("{} {:?} reader finished", source, stream);
    })
}
