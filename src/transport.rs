// Copyright (c) 2025 Quilt Foundation

//! Length-prefixed JSON framing over a byte stream.
//!
//! Each frame is a big-endian `u32` length followed by a JSON body. Values
//! in the store are small, so a modest frame cap is enough to bound what a
//! misbehaving peer can make us allocate.

use crate::error::{GossipError, GossipResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame body.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

/// Write one framed message.
pub async fn write_frame<S, T>(stream: &mut S, msg: &T) -> GossipResult<()>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(GossipError::Codec(format!(
            "frame of {} bytes exceeds cap",
            body.len()
        )));
    }
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one framed message.
pub async fn read_frame<S, T>(stream: &mut S) -> GossipResult<T>
where
    S: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(GossipError::Codec(format!(
            "frame of {len} bytes exceeds cap"
        )));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::GossipRequest;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let req = GossipRequest {
            addr: "node-a:9000".to_string(),
            max_seq: 42,
        };

        write_frame(&mut client, &req).await.unwrap();
        let back: GossipRequest = read_frame(&mut server).await.unwrap();
        assert_eq!(back, req);
    }

    #[tokio::test]
    async fn test_multiple_frames_in_order() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        for seq in 0..3i64 {
            let req = GossipRequest {
                addr: "node-a:9000".to_string(),
                max_seq: seq,
            };
            write_frame(&mut client, &req).await.unwrap();
        }
        for seq in 0..3i64 {
            let back: GossipRequest = read_frame(&mut server).await.unwrap();
            assert_eq!(back.max_seq, seq);
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            let len = (MAX_FRAME_BYTES as u32 + 1).to_be_bytes();
            client.write_all(&len).await.unwrap();
            client
        });

        let err = read_frame::<_, GossipRequest>(&mut server)
            .await
            .unwrap_err();
        assert!(matches!(err, GossipError::Codec(_)));
        drop(writer.await.unwrap());
    }
}
