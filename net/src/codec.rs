//! Line framing between the byte streams and the node's channels.
//!
//! The reader task turns each input line into an [`Envelope`] and feeds the
//! node; the writer task drains the outbound channel, one envelope per line.
//! A line that does not parse, or is not UTF-8, is logged and skipped; only
//! an I/O error on the stream itself ends the reader.

use {
    crate::{
        config::NodeConfig,
        error::{NetError, Result},
        message::Envelope,
    },
    futures::{SinkExt, StreamExt},
    log::{debug, warn},
    std::io,
    tokio::{
        io::{AsyncRead, AsyncWrite},
        sync::mpsc,
        task::JoinHandle,
    },
    tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError},
};

pub fn decode_line(line: &str) -> Result<Envelope> {
    Ok(serde_json::from_str(line)?)
}

pub fn encode_line(envelope: &Envelope) -> Result<String> {
    Ok(serde_json::to_string(envelope)?)
}

/// Spawn the task reading envelopes from `reader`.
///
/// The returned channel closes when the stream ends.  The task fails if
/// the receiving side is dropped while input is still arriving.
pub fn spawn_reader<R>(
    reader: R,
    config: &NodeConfig,
) -> (mpsc::Receiver<Envelope>, JoinHandle<Result<()>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.inbound_buffer_size);
    let codec = LinesCodec::new_with_max_length(config.max_line_length);
    let handle = tokio::spawn(async move {
        let mut lines = FramedRead::new(reader, codec);
        // After a decode error the framed reader yields a single `None`
        // before it resumes reading.
        let mut resumable = false;
        loop {
            let line = match lines.next().await {
                Some(Ok(line)) => line,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!("dropping input line longer than the configured maximum");
                    resumable = true;
                    continue;
                }
                // The codec has already consumed the offending line.
                Some(Err(LinesCodecError::Io(e))) if e.kind() == io::ErrorKind::InvalidData => {
                    warn!("dropping input line that is not valid UTF-8: {}", e);
                    resumable = true;
                    continue;
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(NetError::Transport(e)),
                None if resumable => {
                    resumable = false;
                    continue;
                }
                None => break,
            };
            resumable = false;
            if line.trim().is_empty() {
                continue;
            }
            let envelope = match decode_line(&line) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("dropping malformed line: {}", e);
                    continue;
                }
            };
            if tx.send(envelope).await.is_err() {
                return Err(NetError::ChannelClosed);
            }
        }
        debug!("input stream ended");
        Ok(())
    });
    (rx, handle)
}

/// Spawn the task writing envelopes from `outbound` to `writer`.
///
/// Runs until every sender of `outbound` is dropped.
pub fn spawn_writer<W>(
    writer: W,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
) -> JoinHandle<Result<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = FramedWrite::new(writer, LinesCodec::new());
        while let Some(envelope) = outbound.recv().await {
            let line = match encode_line(&envelope) {
                Ok(line) => line,
                Err(e) => {
                    warn!("cannot encode {} to {}: {}", envelope.body.kind, envelope.dest, e);
                    continue;
                }
            };
            lines.send(line).await?;
        }
        Ok(())
    })
}
