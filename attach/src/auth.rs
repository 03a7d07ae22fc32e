//! User authentication (RFC 4252).
//!
//! The server takes any password, or any ed25519 key the client can sign
//! with, for the `daemon` user. Every other user and the `none` method are
//! refused. Transport security is the hypervisor's serial link, not this
//! exchange.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::AttachError;
use crate::msgs::{
    MSG_SERVICE_ACCEPT, MSG_SERVICE_REQUEST, MSG_USERAUTH_FAILURE, MSG_USERAUTH_PK_OK,
    MSG_USERAUTH_REQUEST, MSG_USERAUTH_SUCCESS,
};
use crate::transport::hostkey;
use crate::transport::{Transport, DISCONNECT_PROTOCOL_ERROR};
use crate::wire::{Cursor, Put};

pub const USER: &str = "daemon";

const USERAUTH: &str = "ssh-userauth";
const CONNECTION: &str = "ssh-connection";
const METHODS: &[&str] = &["publickey", "password"];
const MAX_ATTEMPTS: usize = 20;

enum Verdict {
    Accept,
    Reject,
    /// The key would be accepted; the client should now sign with it.
    KeyOk { algorithm: Vec<u8>, blob: Vec<u8> },
}

/// Run the server side of authentication. Returns the user name.
pub async fn serve<S>(t: &mut Transport<S>) -> Result<String, AttachError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = t.reader.read().await?;
    let mut c = Cursor::new(&request);
    if c.u8()? != MSG_SERVICE_REQUEST || c.utf8()? != USERAUTH {
        t.writer
            .disconnect(DISCONNECT_PROTOCOL_ERROR, "expected ssh-userauth service request")
            .await?;
        return Err(AttachError::protocol("expected ssh-userauth service request"));
    }
    let mut accept = vec![MSG_SERVICE_ACCEPT];
    accept.put_string(USERAUTH.as_bytes());
    t.writer.write(&accept).await?;

    for _ in 0..MAX_ATTEMPTS {
        let msg = t.reader.read().await?;
        let mut c = Cursor::new(&msg);
        if c.u8()? != MSG_USERAUTH_REQUEST {
            return Err(AttachError::protocol(format!("unexpected message {} during authentication", msg[0])));
        }
        let user = c.utf8()?;
        let service = c.utf8()?;
        let method = c.utf8()?;
        if service != CONNECTION {
            return Err(AttachError::protocol(format!("unsupported service {}", service)));
        }

        let verdict = match method.as_str() {
            "password" => {
                c.bool()?;
                c.string()?;
                if user == USER { Verdict::Accept } else { Verdict::Reject }
            }
            "publickey" => publickey(&mut c, &t.session_id, &user)?,
            _ => Verdict::Reject,
        };

        match verdict {
            Verdict::Accept => {
                debug!(user = %user, method = %method, "client authenticated");
                t.writer.write(&[MSG_USERAUTH_SUCCESS]).await?;
                return Ok(user);
            }
            Verdict::KeyOk { algorithm, blob } => {
                let mut ok = vec![MSG_USERAUTH_PK_OK];
                ok.put_string(&algorithm);
                ok.put_string(&blob);
                t.writer.write(&ok).await?;
            }
            Verdict::Reject => {
                debug!(user = %user, method = %method, "authentication attempt refused");
                let mut fail = vec![MSG_USERAUTH_FAILURE];
                fail.put_name_list(METHODS);
                fail.put_bool(false);
                t.writer.write(&fail).await?;
            }
        }
    }

    warn!("too many authentication attempts");
    t.writer
        .disconnect(DISCONNECT_PROTOCOL_ERROR, "too many authentication failures")
        .await?;
    Err(AttachError::Auth("too many attempts".into()))
}

fn publickey(c: &mut Cursor<'_>, session_id: &[u8], user: &str) -> Result<Verdict, AttachError> {
    let signed = c.bool()?;
    let algorithm = c.string()?.to_vec();
    let blob = c.string()?.to_vec();
    if user != USER || algorithm != hostkey::ALGORITHM.as_bytes() {
        return Ok(Verdict::Reject);
    }
    if !signed {
        return Ok(Verdict::KeyOk { algorithm, blob });
    }
    let signature = c.string()?;
    let data = signed_data(session_id, user, &algorithm, &blob);
    match hostkey::verify(&blob, &data, signature) {
        Ok(()) => Ok(Verdict::Accept),
        Err(e) => {
            debug!("public key signature rejected: {}", e);
            Ok(Verdict::Reject)
        }
    }
}

/// What a publickey request signs (RFC 4252 section 7).
fn signed_data(session_id: &[u8], user: &str, algorithm: &[u8], blob: &[u8]) -> Vec<u8> {
    let mut data = Vec::new();
    data.put_string(session_id);
    data.put_u8(MSG_USERAUTH_REQUEST);
    data.put_string(user.as_bytes());
    data.put_string(CONNECTION.as_bytes());
    data.put_string(b"publickey");
    data.put_bool(true);
    data.put_string(algorithm);
    data.put_string(blob);
    data
}

/// Run the client side: password authentication as `user`.
pub async fn login<S>(t: &mut Transport<S>, user: &str, password: &str) -> Result<(), AttachError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = vec![MSG_SERVICE_REQUEST];
    request.put_string(USERAUTH.as_bytes());
    t.writer.write(&request).await?;
    let reply = t.reader.read().await?;
    if reply[0] != MSG_SERVICE_ACCEPT {
        return Err(AttachError::protocol("server refused ssh-userauth"));
    }

    let mut auth = vec![MSG_USERAUTH_REQUEST];
    auth.put_string(user.as_bytes());
    auth.put_string(CONNECTION.as_bytes());
    auth.put_string(b"password");
    auth.put_bool(false);
    auth.put_string(password.as_bytes());
    t.writer.write(&auth).await?;

    let reply = t.reader.read().await?;
    match reply[0] {
        MSG_USERAUTH_SUCCESS => Ok(()),
        MSG_USERAUTH_FAILURE => {
            let methods = Cursor::new(&reply[1..]).name_list()?;
            Err(AttachError::Auth(format!(
                "password refused for {}, server allows {}",
                user,
                methods.join(",")
            )))
        }
        other => Err(AttachError::protocol(format!("unexpected message {} during authentication", other))),
    }
}
