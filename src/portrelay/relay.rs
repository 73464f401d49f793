use std::{fmt, io};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// When a relayed connection is considered finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayPolicy {
    /// The first direction to end (EOF or error) tears down both streams.
    #[default]
    FirstClose,
    /// EOF is forwarded as a write shutdown and the relay waits for both
    /// directions to finish. Errors still tear down both streams.
    Drain,
}

impl RelayPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "first_close" => Some(RelayPolicy::FirstClose),
            "drain" => Some(RelayPolicy::Drain),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelayPolicy::FirstClose => "first_close",
            RelayPolicy::Drain => "drain",
        }
    }
}

impl fmt::Display for RelayPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    pub policy: RelayPolicy,
    pub buffer_size: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            policy: RelayPolicy::default(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// client -> target
    Ingress,
    /// target -> client
    Egress,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Ingress => f.write_str("client->target"),
            Direction::Egress => f.write_str("target->client"),
        }
    }
}

#[derive(Debug, Default)]
pub struct RelayStats {
    pub ingress: u64,
    pub egress: u64,
    /// Direction whose end closed the pair; `None` under [`RelayPolicy::Drain`].
    pub ended_by: Option<Direction>,
    pub error: Option<io::Error>,
}

/// Copy bytes both ways between `client` and `target` until the policy says
/// the pair is done. Both streams are shut down and dropped before returning.
pub async fn relay<C, T>(client: C, target: T, opts: RelayOptions) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let buffer_size = opts.buffer_size.max(1);
    match opts.policy {
        RelayPolicy::FirstClose => relay_first_close(client, target, buffer_size).await,
        RelayPolicy::Drain => relay_drain(client, target, buffer_size).await,
    }
}

async fn relay_first_close<C, T>(client: C, target: T, buffer_size: usize) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut target_rd, mut target_wr) = tokio::io::split(target);

    let mut ingress = 0u64;
    let mut egress = 0u64;

    let (ended_by, res) = {
        let up = copy_counted(&mut client_rd, &mut target_wr, buffer_size, &mut ingress);
        let down = copy_counted(&mut target_rd, &mut client_wr, buffer_size, &mut egress);
        // The losing copy is dropped here, releasing its halves.
        tokio::select! {
            res = up => (Direction::Ingress, res),
            res = down => (Direction::Egress, res),
        }
    };

    let _ = client_wr.shutdown().await;
    let _ = target_wr.shutdown().await;

    RelayStats {
        ingress,
        egress,
        ended_by: Some(ended_by),
        error: res.err(),
    }
}

async fn relay_drain<C, T>(mut client: C, mut target: T, buffer_size: usize) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let res =
        tokio::io::copy_bidirectional_with_sizes(&mut client, &mut target, buffer_size, buffer_size)
            .await;

    let _ = client.shutdown().await;
    let _ = target.shutdown().await;

    match res {
        Ok((ingress, egress)) => RelayStats {
            ingress,
            egress,
            ended_by: None,
            error: None,
        },
        Err(err) => RelayStats {
            error: Some(err),
            ..RelayStats::default()
        },
    }
}

async fn copy_counted<R, W>(
    rd: &mut R,
    wr: &mut W,
    buffer_size: usize,
    copied: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = rd.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        wr.write_all(&buf[..n]).await?;
        wr.flush().await?;
        *copied += n as u64;
    }
}
