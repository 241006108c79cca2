use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use codec::HEADER_SIZE;
use service::{
    Link, SendError, TX_BACKPRESSURE_LIMIT, Timestamp,
    session::{Session, SessionOptions},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::sleep,
};

use crate::config::Config;

/// Accept datapath connections forever, one switch session per connection.
pub async fn start(config: &Config) -> Result<()> {
    let options = config.session_options()?;
    let listener = TcpListener::bind(config.controller.listen).await?;
    log::info!("controller listening on {}", config.controller.listen);

    loop {
        let (socket, source) = listener.accept().await?;
        let options = options.clone();
        let name = format!("tcp:{source}");

        log::info!("{}: datapath connected", name);
        tokio::spawn(async move {
            match process_datapath(socket, name.clone(), options).await {
                Ok(()) => log::info!("{}: datapath disconnected", name),
                Err(error) => log::warn!("{}: connection failed: {}", name, error),
            }
        });
    }
}

/// The session's transport: a bounded channel into a writer task.
///
/// The channel capacity is the session's backpressure window. `send` counts
/// a message as in flight when the channel accepts it; the writer task
/// uncounts it after the socket write, so the count is exactly the messages
/// accepted but not yet on the wire.
struct ChannelLink {
    name: String,
    pending: Arc<AtomicUsize>,
    sender: mpsc::Sender<Bytes>,
}

impl Link for ChannelLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    fn send(&mut self, message: Bytes) -> Result<(), SendError> {
        match self.sender.try_send(message) {
            Ok(()) => {
                self.pending.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::WouldBlock),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::NotConnected),
        }
    }
}

async fn process_datapath(socket: TcpStream, name: String, options: SessionOptions) -> Result<()> {
    socket.set_nodelay(true)?;

    let (mut reader, mut writer) = socket.into_split();
    let (sender, mut receiver) = mpsc::channel::<Bytes>(TX_BACKPRESSURE_LIMIT);
    let pending = Arc::new(AtomicUsize::new(0));

    let written = pending.clone();
    let write_task = tokio::spawn(async move {
        while let Some(message) = receiver.recv().await {
            let result = writer.write_all(&message).await;
            written.fetch_sub(1, Ordering::Relaxed);

            if result.is_err() {
                break;
            }
        }
    });

    // The session runs on seconds since the connection came up; it never
    // sees the wall clock.
    let started = Instant::now();
    let mut link = ChannelLink {
        name,
        pending,
        sender,
    };

    let mut session = Session::new(&mut link, 0, options);
    let mut buffer = BytesMut::with_capacity(4096);

    loop {
        let now = started.elapsed().as_secs();
        let deadline = session.wait(now);

        tokio::select! {
            read = reader.read_buf(&mut buffer) => {
                if read? == 0 {
                    break;
                }

                while let Some(message) = next_message(&mut buffer)? {
                    session.process_message(&mut link, started.elapsed().as_secs(), &message);
                }
            }
            _ = maintenance(deadline, now) => {
                session.run(started.elapsed().as_secs());
            }
        }
    }

    // Closing the channel lets the writer task drain and exit.
    drop(link);
    write_task.await?;

    Ok(())
}

/// Split one complete message off the front of the read buffer, framed by
/// the length field of the common header.
fn next_message(buffer: &mut BytesMut) -> Result<Option<Bytes>> {
    if buffer.len() < HEADER_SIZE {
        return Ok(None);
    }

    let length = u16::from_be_bytes([buffer[2], buffer[3]]) as usize;
    if length < HEADER_SIZE {
        anyhow::bail!("malformed message length {length}");
    }

    if buffer.len() < length {
        return Ok(None);
    }

    Ok(Some(buffer.split_to(length).freeze()))
}

async fn maintenance(deadline: Option<Timestamp>, now: Timestamp) {
    match deadline {
        Some(at) => sleep(Duration::from_secs(at.saturating_sub(now).max(1))).await,
        None => std::future::pending::<()>().await,
    }
}
