use crate::buffer::BufferPool;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// relay copies bytes between `a` and `b` in both directions at once.
///
/// End of stream on one side is forwarded as a write shutdown to the other
/// side; the relay returns once both directions are done, or as soon as one
/// of them fails. Both streams are dropped on return. The result is the
/// number of bytes copied a -> b and b -> a.
pub async fn relay<A, B>(a: A, b: B, pool: &Arc<BufferPool>) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    tokio::try_join!(
        copy_half(&mut a_read, &mut b_write, pool),
        copy_half(&mut b_read, &mut a_write, pool),
    )
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W, pool: &Arc<BufferPool>) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.get();
    let mut copied = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            // peer may already be gone
            let _ = writer.shutdown().await;
            return Ok(copied);
        }
        writer.write_all(&buf[..n]).await?;
        copied += n as u64;
    }
}
