//! SMTP greeting helpers.
//!
//! The proxy cannot pick a mail backend until the client names a
//! recipient, and the client will not do that until somebody greets it.
//! So the proxy speaks first: [`stuff_greeting`] sends the replies a
//! client expects through `RCPT TO`, and once the real backend is dialed,
//! [`eat_greeting`] consumes the backend's own copies of those replies so
//! the client never sees them twice.

use sixgate_core::{SixgateError, SixgateResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Send the canned 220/250/250 sequence to the client: a greeting naming
/// the zone, then blind acknowledgements for the HELO/EHLO and MAIL FROM
/// commands the client is about to send.
pub async fn stuff_greeting<W>(w: &mut W, zone: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let zone = zone.trim_end_matches('.');
    let banner = format!(
        "220 {zone} IPv4-to-IPv6 mail relay\r\n\
         250 accepted blindly, keep going\r\n\
         250 now send RCPT TO so I know which mail server you want\r\n"
    );
    w.write_all(banner.as_bytes()).await?;
    w.flush().await
}

/// Consume the backend's greeting sequence: one 220 reply, then two 250
/// replies. Leaves the stream positioned at the backend's next byte.
pub async fn eat_greeting<R>(r: &mut R) -> SixgateResult<()>
where
    R: AsyncRead + Unpin,
{
    // server welcome banner
    eat_reply(r, 220).await?;
    // replies to HELO/EHLO and MAIL FROM, which the proxy already
    // answered on the backend's behalf
    eat_reply(r, 250).await?;
    eat_reply(r, 250).await?;
    Ok(())
}

/// Read one full SMTP reply with the given code, including multiline
/// continuations (`250-...`). Reply lines end at LF; a space after the
/// code marks the final line.
async fn eat_reply<R>(r: &mut R, code: u16) -> SixgateResult<()>
where
    R: AsyncRead + Unpin,
{
    let expected = format!("{code:03}");
    loop {
        let mut code_buf = [0u8; 3];
        r.read_exact(&mut code_buf).await?;
        if code_buf != expected.as_bytes() {
            return Err(SixgateError::Proto(format!(
                "unexpected SMTP reply: {} (expected {expected})",
                String::from_utf8_lossy(&code_buf)
            )));
        }

        let mut sep = [0u8; 1];
        r.read_exact(&mut sep).await?;
        match sep[0] {
            b' ' => {
                eat_until(r, b'\n').await?;
                return Ok(());
            }
            b'-' => {
                // continuation line; the same code repeats
                eat_until(r, b'\n').await?;
            }
            other => {
                return Err(SixgateError::Proto(format!(
                    "unexpected character after SMTP code: {:?}",
                    other as char
                )))
            }
        }
    }
}

/// Read and discard bytes up to and including the next `byte`.
///
/// One byte at a time on purpose: anything past the reply belongs to the
/// spliced stream and must not be swallowed here.
async fn eat_until<R>(r: &mut R, byte: u8) -> SixgateResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 1];
    loop {
        r.read_exact(&mut buf).await?;
        if buf[0] == byte {
            return Ok(());
        }
    }
}
