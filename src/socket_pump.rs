use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tracing::{debug, info};
use crate::engine::PacketEngine;
use crate::engine_stream::PacketEngineStream;
use crate::error::EngineResult;

const PUMP_BUF_SIZE: usize = 4096;

impl PacketEngineStream {
    /// Hand the channel over to a local socket: returns one end of a connected socket pair,
    ///  and moves bytes between the other end and the channel in a background task.
    ///
    /// When the pump ends for whatever reason (the caller closing its socket, the channel being
    ///  closed, an error), the channel is disconnected.
    pub fn detach_socket(self) -> EngineResult<StdUnixStream> {
        let (pump_end, caller_end) = UnixStream::pair()?;
        let caller_end = caller_end.into_std()?;
        caller_end.set_nonblocking(false)?;

        let engine = self.engine().clone();
        let channel_id = self.channel_id();
        let (done_send, done_recv) = oneshot::channel();

        tokio::spawn(async move {
            // dropped without sending if the pump panics, which resolves the receiver as well
            let done_send = done_send;
            match pump(&self, pump_end).await {
                Ok(()) => debug!("socket pump for channel {} finished", channel_id),
                Err(e) => debug!("socket pump for channel {} terminated: {}", channel_id, e),
            }
            let _ = done_send.send(());
        });
        engine.disconnect_on_completion(channel_id, done_recv);

        info!("channel {} detached to a local socket", channel_id);
        Ok(caller_end)
    }
}

impl PacketEngine {
    /// Disconnect a channel once, when `done` resolves
    pub(crate) fn disconnect_on_completion(self: &Arc<Self>, channel_id: u32, done: oneshot::Receiver<()>) {
        let engine = self.clone();
        tokio::spawn(async move {
            let _ = done.await;
            engine.disconnect(channel_id).await;
        });
    }
}

async fn pump(stream: &PacketEngineStream, socket: UnixStream) -> EngineResult<()> {
    let (mut reader, mut writer) = socket.into_split();

    let to_channel = async {
        let mut buf = vec![0u8; PUMP_BUF_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }

            let max_message_len = stream.max_message_len().await?;
            for chunk in buf[..n].chunks(max_message_len) {
                stream.push(chunk, None).await?;
            }
        }
    };

    let from_channel = async {
        let mut buf = vec![0u8; PUMP_BUF_SIZE];
        loop {
            let n = stream.pull(&mut buf, None).await?;
            writer.write_all(&buf[..n]).await?;
        }
    };

    tokio::select! {
        r = to_channel => r,
        r = from_channel => r,
    }
}
