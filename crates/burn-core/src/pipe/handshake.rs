//! Secret handshake.
//!
//! Two directions are used:
//!
//! - **Companion**: the engine (server) sends `[u32 units][secret UTF-16LE][u32 pid]`;
//!   the companion verifies it and acknowledges with its own pid.
//! - **Application**: the UI process (client) sends the same secret frame;
//!   the engine verifies it and acknowledges with `[i32 hresult][u32 pid]`.
//!
//! Secrets are compared exactly (case-sensitive). A peer announcing more
//! than [`MAX_SECRET_UNITS`] is rejected before anything is allocated.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::warn;
use zeroize::Zeroizing;

use super::PipeError;
use super::channel::{Authenticated, PipeChannel, Unauthenticated};
use super::frame::read_full_or_eof;
use crate::hresult::HResult;
use crate::security::MAX_SECRET_UNITS;

async fn read_u32<R>(reader: &mut R) -> Result<u32, PipeError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; 4];
    if !read_full_or_eof(reader, &mut buf).await? {
        return Err(PipeError::Truncated);
    }
    Ok(u32::from_le_bytes(buf))
}

async fn write_secret<W>(writer: &mut W, secret: &str, pid: u32) -> Result<(), PipeError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let units: Zeroizing<Vec<u16>> = Zeroizing::new(secret.encode_utf16().collect());
    if units.len() > MAX_SECRET_UNITS {
        return Err(PipeError::SecretTooLong(units.len()));
    }
    let mut frame = Zeroizing::new(Vec::with_capacity(8 + units.len() * 2));
    frame.extend_from_slice(&(units.len() as u32).to_le_bytes());
    for unit in units.iter() {
        frame.extend_from_slice(&unit.to_le_bytes());
    }
    frame.extend_from_slice(&pid.to_le_bytes());
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a secret frame. The announced length is checked before allocating.
async fn read_secret<R>(reader: &mut R) -> Result<(Zeroizing<String>, u32), PipeError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let units = read_u32(reader).await? as usize;
    if units > MAX_SECRET_UNITS {
        warn!(units, "Rejected oversized handshake secret");
        return Err(PipeError::SecretTooLong(units));
    }
    let mut bytes = Zeroizing::new(vec![0u8; units * 2]);
    if !read_full_or_eof(reader, &mut bytes).await? {
        return Err(PipeError::Truncated);
    }
    let wide: Zeroizing<Vec<u16>> = Zeroizing::new(
        bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect(),
    );
    let secret = String::from_utf16(&wide).map_err(|_| PipeError::Malformed("secret is not UTF-16"))?;
    let pid = read_u32(reader).await?;
    Ok((Zeroizing::new(secret), pid))
}

impl PipeChannel<Unauthenticated> {
    /// Engine side of the companion handshake.
    pub async fn offer_secret(
        mut self,
        secret: &str,
        pid: u32,
    ) -> Result<PipeChannel<Authenticated>, PipeError> {
        write_secret(&mut self.stream, secret, pid).await?;
        let peer_pid = read_u32(&mut self.stream).await?;
        Ok(self.into_authenticated(peer_pid))
    }

    /// Companion side: verify the offered secret and acknowledge with `pid`.
    pub async fn accept_offered_secret(
        mut self,
        expected: &str,
        pid: u32,
    ) -> Result<PipeChannel<Authenticated>, PipeError> {
        let (secret, parent_pid) = read_secret(&mut self.stream).await?;
        if secret.as_str() != expected {
            warn!(pipe = %self.label(), "Handshake secret mismatch");
            return Err(PipeError::SecretMismatch);
        }
        self.stream.write_all(&pid.to_le_bytes()).await?;
        self.stream.flush().await?;
        Ok(self.into_authenticated(parent_pid))
    }

    /// Application side: present the secret and wait for the engine's verdict.
    pub async fn present_secret(
        mut self,
        secret: &str,
        pid: u32,
    ) -> Result<PipeChannel<Authenticated>, PipeError> {
        write_secret(&mut self.stream, secret, pid).await?;
        let hr = HResult::from_u32(read_u32(&mut self.stream).await?);
        let engine_pid = read_u32(&mut self.stream).await?;
        if hr.is_failure() {
            return Err(PipeError::HandshakeRejected(hr));
        }
        Ok(self.into_authenticated(engine_pid))
    }

    /// Engine side of the application handshake.
    pub async fn verify_presented_secret(
        mut self,
        expected: &str,
        pid: u32,
    ) -> Result<PipeChannel<Authenticated>, PipeError> {
        let (secret, peer_pid) = read_secret(&mut self.stream).await?;
        let accepted = secret.as_str() == expected;
        let hr = if accepted {
            HResult::S_OK
        } else {
            HResult::INVALID_DATA
        };
        let mut ack = [0u8; 8];
        ack[..4].copy_from_slice(&hr.as_u32().to_le_bytes());
        ack[4..].copy_from_slice(&pid.to_le_bytes());
        self.stream.write_all(&ack).await?;
        self.stream.flush().await?;
        if !accepted {
            warn!(pipe = %self.label(), peer_pid, "Handshake secret mismatch");
            return Err(PipeError::SecretMismatch);
        }
        Ok(self.into_authenticated(peer_pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (PipeChannel<Unauthenticated>, PipeChannel<Unauthenticated>) {
        let (a, b) = tokio::io::duplex(4096);
        (
            PipeChannel::new(Box::new(a), "server"),
            PipeChannel::new(Box::new(b), "client"),
        )
    }

    #[tokio::test]
    async fn test_companion_handshake() {
        let (server, client) = pair();
        let child = tokio::spawn(async move { client.accept_offered_secret("{S3CRET}", 200).await });
        let parent = server.offer_secret("{S3CRET}", 100).await.unwrap();
        let child = child.await.unwrap().unwrap();
        assert_eq!(parent.peer_pid(), 200);
        assert_eq!(child.peer_pid(), 100);
    }

    #[tokio::test]
    async fn test_companion_handshake_is_case_sensitive() {
        let (server, client) = pair();
        let child = tokio::spawn(async move { client.accept_offered_secret("{secret}", 2).await });
        let _ = server.offer_secret("{SECRET}", 1).await;
        assert!(matches!(
            child.await.unwrap(),
            Err(PipeError::SecretMismatch)
        ));
    }

    #[tokio::test]
    async fn test_application_handshake_rejection() {
        let (engine, ui) = pair();
        let verify = tokio::spawn(async move { engine.verify_presented_secret("good", 1).await });
        let result = ui.present_secret("bad", 2).await;
        assert!(matches!(
            result,
            Err(PipeError::HandshakeRejected(hr)) if hr == HResult::INVALID_DATA
        ));
        assert!(matches!(
            verify.await.unwrap(),
            Err(PipeError::SecretMismatch)
        ));
    }

    #[tokio::test]
    async fn test_oversized_secret_rejected_before_read() {
        let (a, b) = tokio::io::duplex(64);
        let mut writer = a;
        tokio::spawn(async move {
            let _ = writer.write_all(&100_000u32.to_le_bytes()).await;
        });
        let client = PipeChannel::new(Box::new(b), "client");
        assert!(matches!(
            client.accept_offered_secret("x", 1).await,
            Err(PipeError::SecretTooLong(100_000))
        ));
    }

    #[tokio::test]
    async fn test_writer_refuses_oversized_secret() {
        let (server, _client) = pair();
        let long = "s".repeat(MAX_SECRET_UNITS + 1);
        assert!(matches!(
            server.offer_secret(&long, 1).await,
            Err(PipeError::SecretTooLong(_))
        ));
    }
}
