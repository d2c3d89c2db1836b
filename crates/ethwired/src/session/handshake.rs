//! RLPx auth/ack exchange over a byte stream.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use ethwire_core::crypto::{short_id, Keypair, NodeId, RlpxInitiator, RlpxResponder, SessionSecrets};
use ethwire_core::wire::MAX_HANDSHAKE_SIZE;

use super::SessionError;

/// Dial side: send auth, wait for ack.
pub async fn initiate<S>(
    stream: &mut S,
    keypair: &Keypair,
    remote: &NodeId,
    limit: Duration,
) -> Result<SessionSecrets, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (initiator, auth) = RlpxInitiator::new(keypair, remote)?;
    stream.write_all(&auth).await?;
    tracing::trace!(peer = %short_id(remote), len = auth.len(), "sent auth");

    let ack = timeout(limit, read_message(stream))
        .await
        .map_err(|_| SessionError::Timeout("ack"))??;
    let secrets = initiator.finish(keypair, &ack)?;
    tracing::debug!(peer = %short_id(remote), "handshake complete (initiator)");
    Ok(secrets)
}

/// Listen side: wait for auth, send ack.
pub async fn accept<S>(stream: &mut S, keypair: &Keypair, limit: Duration) -> Result<SessionSecrets, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let auth = timeout(limit, read_message(stream))
        .await
        .map_err(|_| SessionError::Timeout("auth"))??;
    let (secrets, ack) = RlpxResponder::new().respond(keypair, &auth)?;
    stream.write_all(&ack).await?;
    tracing::debug!(peer = %short_id(&secrets.remote_id), "handshake complete (responder)");
    Ok(secrets)
}

/// One size-prefixed ECIES message, prefix included.
async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, SessionError> {
    let mut prefix = [0u8; 2];
    reader.read_exact(&mut prefix).await?;
    let size = u16::from_be_bytes(prefix) as usize;
    if size > MAX_HANDSHAKE_SIZE {
        return Err(SessionError::HandshakeTooLarge(size));
    }
    let mut message = vec![0u8; 2 + size];
    message[..2].copy_from_slice(&prefix);
    reader.read_exact(&mut message[2..]).await?;
    Ok(message)
}
