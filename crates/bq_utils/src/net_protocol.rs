//! Read/write protocol for messages between the queue, workers and job clients.
//! The first 4 bytes of any message is the size of the message (in big-endian order).
//! The rest of the message are the contents, which are serde-serialized json.

pub mod bucket;
pub mod ids;
pub mod queue;
pub mod results;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Messages larger than this are refused rather than buffered.
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// Reads a message from an async stream.
pub async fn async_read<R, T>(reader: &mut R) -> Result<T, std::io::Error>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut msg_size_buf = [0; 4];
    reader.read_exact(&mut msg_size_buf).await?;
    let msg_size = u32::from_be_bytes(msg_size_buf);

    if msg_size > MAX_MESSAGE_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("message of {msg_size} bytes exceeds the limit of {MAX_MESSAGE_SIZE}"),
        ));
    }

    let mut msg_buf = vec![0; msg_size as usize];
    reader.read_exact(&mut msg_buf).await?;

    let msg = serde_json::from_slice(&msg_buf)?;
    Ok(msg)
}

/// Writes a message to an async stream.
pub async fn async_write<W, T>(writer: &mut W, msg: &T) -> Result<(), std::io::Error>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let msg_json = serde_json::to_vec(msg)?;

    let msg_size = u32::try_from(msg_json.len())
        .ok()
        .filter(|size| *size <= MAX_MESSAGE_SIZE)
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "message too large")
        })?;

    let mut msg_buf = Vec::with_capacity(4 + msg_json.len());
    msg_buf.extend_from_slice(&msg_size.to_be_bytes());
    msg_buf.extend_from_slice(&msg_json);
    writer.write_all(&msg_buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::{async_read, async_write, MAX_MESSAGE_SIZE};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn frame_is_size_prefixed_json() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        async_write(&mut client, &vec!["a", "b"]).await.unwrap();
        drop(client);

        let mut raw = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut raw)
            .await
            .unwrap();
        assert_eq!(&raw[..4], &9u32.to_be_bytes());
        assert_eq!(&raw[4..], br#"["a","b"]"#);
    }

    #[tokio::test]
    async fn reads_back_written_message() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        async_write(&mut client, &(1u32, "one")).await.unwrap();
        let msg: (u32, String) = async_read(&mut server).await.unwrap();
        assert_eq!(msg, (1, "one".to_owned()));
    }

    #[tokio::test]
    async fn refuses_oversized_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(MAX_MESSAGE_SIZE + 1).to_be_bytes())
            .await
            .unwrap();
        let err = async_read::<_, ()>(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(b"[1,").await.unwrap();
        drop(client);
        let err = async_read::<_, Vec<u32>>(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
