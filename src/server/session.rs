use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;

use crate::broker::Broker;
use crate::error::{Error, ReplyCode, Result};
use crate::protocol::{read_frame, write_frame, write_frames, Frame};

/// Runs one client connection until either side closes it.
#[tracing::instrument(name = "session", skip_all)]
pub async fn serve<S>(stream: S, broker: Broker) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (mut reader, mut writer) = (BufReader::new(reader), BufWriter::new(writer));
    let mut rdbuf = Vec::with_capacity(1024);

    let (username, password, vhost) = match read_frame(&mut reader, &mut rdbuf).await? {
        Some(Frame::Open {
            username,
            password,
            vhost,
        }) => (username, password, vhost),
        Some(other) => {
            tracing::warn!(?other, "expected an open frame");
            let close = Frame::Close {
                code: ReplyCode::FrameError,
                text: "expected an open frame".into(),
            };
            write_frame(&mut writer, &close).await?;
            writer.flush().await?;
            return Err(Error::Protocol("connection did not start with open".into()));
        },
        None => return Ok(()),
    };

    let (outbound, rx) = mpsc::unbounded_channel();
    let connection = match broker.open(&username, &password, &vhost, outbound.clone()).await {
        Ok(connection) => connection,
        Err(Error::Refused { code, text }) => {
            write_frame(&mut writer, &Frame::Close { code, text }).await?;
            writer.flush().await?;
            return Ok(());
        },
        Err(err) => return Err(err),
    };

    write_frame(&mut writer, &Frame::OpenOk { connection }).await?;
    writer.flush().await?;

    let mut writer_task = tokio::spawn(write_frames(writer, rx));

    let result = loop {
        tokio::select! {
            frame = read_frame(&mut reader, &mut rdbuf) => match frame {
                Ok(Some(frame)) => {
                    if let Err(err) = broker.submit(connection, frame) {
                        break Err(err);
                    }
                },
                Ok(None) => break Ok(()),
                Err(err @ Error::Codec(_)) => {
                    tracing::warn!(%connection, %err, "malformed frame");
                    let close = Frame::Close {
                        code: ReplyCode::FrameError,
                        text: err.to_string(),
                    };
                    // the writer shuts the stream down once this is out
                    let _ = outbound.send(close);
                    break Err(err);
                },
                Err(err) => break Err(err),
            },
            written = &mut writer_task => {
                match written {
                    Ok(Ok(())) => {},
                    Ok(Err(err)) => tracing::debug!(%connection, %err, "writer stopped"),
                    Err(err) => tracing::error!(%connection, task_join_error = %err),
                }
                break Ok(());
            },
        }
    };

    drop(outbound);
    broker.disconnect(connection);
    tracing::info!(%connection, "session ended");
    result
}
