use crate::config::UserConfig;
use async_trait::async_trait;
use data_encoding::{BASE64, HEXLOWER};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;

pub mod dovecot;

/// Where passwords are checked. The default store matches against the
/// configured user list; the dovecot backend talks to a Unix socket and
/// can only verify, not reveal, passwords.
#[async_trait]
pub trait CredentialStore: Send + Sync + std::fmt::Debug {
    async fn verify(&self, username: &str, password: &str) -> anyhow::Result<bool>;

    /// The stored password, needed by the digest mechanisms.
    /// Backends that cannot reveal passwords return None.
    async fn lookup(&self, username: &str) -> anyhow::Result<Option<String>>;

    fn supports_lookup(&self) -> bool {
        true
    }
}

#[derive(Debug)]
pub struct ConfigCredentialStore {
    users: Vec<UserConfig>,
}

impl ConfigCredentialStore {
    pub fn new(users: Vec<UserConfig>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl CredentialStore for ConfigCredentialStore {
    async fn verify(&self, username: &str, password: &str) -> anyhow::Result<bool> {
        Ok(self
            .users
            .iter()
            .any(|u| u.name == username && u.password == password))
    }

    async fn lookup(&self, username: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .users
            .iter()
            .find(|u| u.name == username)
            .map(|u| u.password.clone()))
    }
}

/// What the server should do next in the AUTH sub-dialog
#[derive(Debug, PartialEq, Eq)]
pub enum AuthStep {
    /// Send `334 <payload>` and feed the reply back via respond()
    Challenge(String),
    Success {
        username: String,
    },
    Failed,
}

/// One SASL mechanism dialog. Implementations are single-use: create,
/// call initial() with whatever came on the AUTH line, then respond()
/// until Success or Failed.
#[async_trait]
pub trait Mechanism: Send {
    async fn initial(&mut self, initial_response: Option<String>) -> anyhow::Result<AuthStep>;
    async fn respond(&mut self, line: String) -> anyhow::Result<AuthStep>;
}

/// The mechanisms advertised in EHLO. Digest mechanisms need the raw
/// password, so they are only offered when the backend can supply it.
pub fn mechanism_names(store: &dyn CredentialStore) -> Vec<&'static str> {
    if store.supports_lookup() {
        vec!["PLAIN", "LOGIN", "CRAM-MD5", "DIGEST-MD5"]
    } else {
        vec!["PLAIN", "LOGIN"]
    }
}

pub fn create_mechanism(
    name: &str,
    hostname: &str,
    store: Arc<dyn CredentialStore>,
) -> Option<Box<dyn Mechanism>> {
    if name.eq_ignore_ascii_case("PLAIN") {
        Some(Box::new(Plain { store }))
    } else if name.eq_ignore_ascii_case("LOGIN") {
        Some(Box::new(Login {
            store,
            username: None,
        }))
    } else if name.eq_ignore_ascii_case("CRAM-MD5") && store.supports_lookup() {
        Some(Box::new(CramMd5::new(hostname, store)))
    } else if name.eq_ignore_ascii_case("DIGEST-MD5") && store.supports_lookup() {
        Some(Box::new(DigestMd5::new(hostname, store)))
    } else {
        None
    }
}

/// Random bytes from a cryptographically strong source, hex encoded
pub fn generate_nonce(size: usize) -> String {
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    HEXLOWER.encode(&bytes)
}

fn md5_hex(data: &[u8]) -> String {
    HEXLOWER.encode(Md5::digest(data).as_slice())
}

struct Plain {
    store: Arc<dyn CredentialStore>,
}

impl Plain {
    async fn check(&self, payload: &str) -> anyhow::Result<AuthStep> {
        let Ok(decoded) = BASE64.decode(payload.trim().as_bytes()) else {
            return Ok(AuthStep::Failed);
        };
        // RFC 4616: [authzid] NUL authcid NUL passwd
        let fields: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
        if fields.len() != 3 {
            return Ok(AuthStep::Failed);
        }
        let username = String::from_utf8_lossy(fields[1]).to_string();
        let password = String::from_utf8_lossy(fields[2]).to_string();
        if self.store.verify(&username, &password).await? {
            Ok(AuthStep::Success { username })
        } else {
            Ok(AuthStep::Failed)
        }
    }
}

#[async_trait]
impl Mechanism for Plain {
    async fn initial(&mut self, initial_response: Option<String>) -> anyhow::Result<AuthStep> {
        match initial_response {
            Some(payload) => self.check(&payload).await,
            None => Ok(AuthStep::Challenge(String::new())),
        }
    }

    async fn respond(&mut self, line: String) -> anyhow::Result<AuthStep> {
        self.check(&line).await
    }
}

struct Login {
    store: Arc<dyn CredentialStore>,
    username: Option<String>,
}

#[async_trait]
impl Mechanism for Login {
    async fn initial(&mut self, initial_response: Option<String>) -> anyhow::Result<AuthStep> {
        match initial_response {
            Some(payload) => self.respond(payload).await,
            None => Ok(AuthStep::Challenge(BASE64.encode(b"Username:"))),
        }
    }

    async fn respond(&mut self, line: String) -> anyhow::Result<AuthStep> {
        let Ok(decoded) = BASE64.decode(line.trim().as_bytes()) else {
            return Ok(AuthStep::Failed);
        };
        let text = String::from_utf8_lossy(&decoded).to_string();
        match self.username.take() {
            None => {
                self.username = Some(text);
                Ok(AuthStep::Challenge(BASE64.encode(b"Password:")))
            }
            Some(username) => {
                if self.store.verify(&username, &text).await? {
                    Ok(AuthStep::Success { username })
                } else {
                    Ok(AuthStep::Failed)
                }
            }
        }
    }
}

struct CramMd5 {
    store: Arc<dyn CredentialStore>,
    challenge: String,
}

impl CramMd5 {
    fn new(hostname: &str, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            challenge: format!("<{}@{}>", generate_nonce(16), hostname),
        }
    }
}

/// RFC 2195: the client returns `username SP hex(HMAC-MD5(password, challenge))`
pub fn cram_md5_digest(password: &str, challenge: &str) -> String {
    let mut mac = Hmac::<Md5>::new_from_slice(password.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(challenge.as_bytes());
    HEXLOWER.encode(&mac.finalize().into_bytes())
}

#[async_trait]
impl Mechanism for CramMd5 {
    async fn initial(&mut self, _initial_response: Option<String>) -> anyhow::Result<AuthStep> {
        Ok(AuthStep::Challenge(BASE64.encode(self.challenge.as_bytes())))
    }

    async fn respond(&mut self, line: String) -> anyhow::Result<AuthStep> {
        let Ok(decoded) = BASE64.decode(line.trim().as_bytes()) else {
            return Ok(AuthStep::Failed);
        };
        let text = String::from_utf8_lossy(&decoded).to_string();
        let Some((username, digest)) = text.rsplit_once(' ') else {
            return Ok(AuthStep::Failed);
        };
        let Some(password) = self.store.lookup(username).await? else {
            return Ok(AuthStep::Failed);
        };
        if cram_md5_digest(&password, &self.challenge) == digest.to_ascii_lowercase() {
            Ok(AuthStep::Success {
                username: username.to_string(),
            })
        } else {
            Ok(AuthStep::Failed)
        }
    }
}

enum DigestState {
    WantResponse,
    WantAck { username: String },
}

struct DigestMd5 {
    store: Arc<dyn CredentialStore>,
    realm: String,
    nonce: String,
    state: DigestState,
}

impl DigestMd5 {
    fn new(hostname: &str, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            realm: hostname.to_string(),
            nonce: generate_nonce(16),
            state: DigestState::WantResponse,
        }
    }
}

/// Split an RFC 2831 `key=value,key="quoted value"` list
fn parse_digest_pairs(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let mut rest = text.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_ascii_lowercase();
        rest = &rest[eq + 1..];

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => {
                    let value = quoted[..end].to_string();
                    rest = &quoted[end + 1..];
                    value
                }
                None => {
                    let value = quoted.to_string();
                    rest = "";
                    value
                }
            }
        } else {
            match rest.find(',') {
                Some(end) => {
                    let value = rest[..end].trim().to_string();
                    rest = &rest[end..];
                    value
                }
                None => {
                    let value = rest.trim().to_string();
                    rest = "";
                    value
                }
            }
        };
        map.insert(key, value);
        rest = rest.trim_start();
        rest = rest.strip_prefix(',').unwrap_or(rest);
    }
    map
}

/// RFC 2831 md5-sess response computation, shared by the server-side
/// verification and the rspauth value
pub fn digest_md5_response(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    cnonce: &str,
    nc: &str,
    qop: &str,
    digest_uri: &str,
    a2_prefix: &str,
) -> String {
    let user_hash = Md5::digest(format!("{username}:{realm}:{password}").as_bytes());
    let mut a1 = user_hash.to_vec();
    a1.extend_from_slice(format!(":{nonce}:{cnonce}").as_bytes());
    let ha1 = md5_hex(&a1);
    let ha2 = md5_hex(format!("{a2_prefix}:{digest_uri}").as_bytes());
    md5_hex(format!("{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}").as_bytes())
}

#[async_trait]
impl Mechanism for DigestMd5 {
    async fn initial(&mut self, _initial_response: Option<String>) -> anyhow::Result<AuthStep> {
        let challenge = format!(
            "realm=\"{}\",nonce=\"{}\",qop=\"auth\",charset=utf-8,algorithm=md5-sess",
            self.realm, self.nonce
        );
        Ok(AuthStep::Challenge(BASE64.encode(challenge.as_bytes())))
    }

    async fn respond(&mut self, line: String) -> anyhow::Result<AuthStep> {
        match &self.state {
            DigestState::WantAck { username } => {
                // client acknowledged our rspauth
                return Ok(AuthStep::Success {
                    username: username.clone(),
                });
            }
            DigestState::WantResponse => {}
        }

        let Ok(decoded) = BASE64.decode(line.trim().as_bytes()) else {
            return Ok(AuthStep::Failed);
        };
        let text = String::from_utf8_lossy(&decoded).to_string();
        let pairs = parse_digest_pairs(&text);

        let (Some(username), Some(nonce), Some(cnonce), Some(nc), Some(response), Some(digest_uri)) = (
            pairs.get("username"),
            pairs.get("nonce"),
            pairs.get("cnonce"),
            pairs.get("nc"),
            pairs.get("response"),
            pairs.get("digest-uri"),
        ) else {
            return Ok(AuthStep::Failed);
        };
        if nonce != &self.nonce {
            return Ok(AuthStep::Failed);
        }
        let realm = pairs
            .get("realm")
            .cloned()
            .unwrap_or_else(|| self.realm.clone());
        let qop = pairs
            .get("qop")
            .cloned()
            .unwrap_or_else(|| "auth".to_string());

        let Some(password) = self.store.lookup(username).await? else {
            return Ok(AuthStep::Failed);
        };

        let expected = digest_md5_response(
            username,
            &realm,
            &password,
            &self.nonce,
            cnonce,
            nc,
            &qop,
            digest_uri,
            "AUTHENTICATE",
        );
        if &expected != response {
            return Ok(AuthStep::Failed);
        }

        let rspauth = digest_md5_response(
            username, &realm, &password, &self.nonce, cnonce, nc, &qop, digest_uri, "",
        );
        self.state = DigestState::WantAck {
            username: username.clone(),
        };
        Ok(AuthStep::Challenge(
            BASE64.encode(format!("rspauth={rspauth}").as_bytes()),
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    fn store() -> Arc<dyn CredentialStore> {
        Arc::new(ConfigCredentialStore::new(vec![UserConfig {
            name: "alice".to_string(),
            password: "s3cret".to_string(),
        }]))
    }

    #[tokio::test]
    async fn plain_one_shot() {
        let mut mech = create_mechanism("PLAIN", "mx.test", store()).unwrap();
        let payload = BASE64.encode(b"\x00alice\x00s3cret");
        assert_equal!(
            mech.initial(Some(payload)).await.unwrap(),
            AuthStep::Success {
                username: "alice".to_string()
            }
        );
    }

    #[tokio::test]
    async fn plain_challenge_and_bad_password() {
        let mut mech = create_mechanism("plain", "mx.test", store()).unwrap();
        assert_equal!(
            mech.initial(None).await.unwrap(),
            AuthStep::Challenge(String::new())
        );
        let payload = BASE64.encode(b"\x00alice\x00wrong");
        assert_equal!(mech.respond(payload).await.unwrap(), AuthStep::Failed);
    }

    #[tokio::test]
    async fn login_two_prompts() {
        let mut mech = create_mechanism("LOGIN", "mx.test", store()).unwrap();
        assert_equal!(
            mech.initial(None).await.unwrap(),
            AuthStep::Challenge(BASE64.encode(b"Username:"))
        );
        let step = mech.respond(BASE64.encode(b"alice")).await.unwrap();
        assert_equal!(step, AuthStep::Challenge(BASE64.encode(b"Password:")));
        let step = mech.respond(BASE64.encode(b"s3cret")).await.unwrap();
        assert_equal!(
            step,
            AuthStep::Success {
                username: "alice".to_string()
            }
        );
    }

    #[tokio::test]
    async fn cram_md5_round_trip() {
        let mut mech = create_mechanism("CRAM-MD5", "mx.test", store()).unwrap();
        let AuthStep::Challenge(challenge_b64) = mech.initial(None).await.unwrap() else {
            panic!("expected a challenge");
        };
        let challenge = String::from_utf8(
            BASE64.decode(challenge_b64.as_bytes()).unwrap(),
        )
        .unwrap();
        assert!(challenge.starts_with('<') && challenge.ends_with("@mx.test>"));

        let digest = cram_md5_digest("s3cret", &challenge);
        let reply = BASE64.encode(format!("alice {digest}").as_bytes());
        assert_equal!(
            mech.respond(reply).await.unwrap(),
            AuthStep::Success {
                username: "alice".to_string()
            }
        );
    }

    #[tokio::test]
    async fn cram_md5_wrong_digest() {
        let mut mech = create_mechanism("CRAM-MD5", "mx.test", store()).unwrap();
        mech.initial(None).await.unwrap();
        let reply = BASE64.encode(b"alice 00000000000000000000000000000000");
        assert_equal!(mech.respond(reply).await.unwrap(), AuthStep::Failed);
    }

    #[tokio::test]
    async fn digest_md5_round_trip() {
        let mut mech = create_mechanism("DIGEST-MD5", "mx.test", store()).unwrap();
        let AuthStep::Challenge(challenge_b64) = mech.initial(None).await.unwrap() else {
            panic!("expected a challenge");
        };
        let challenge = String::from_utf8(
            BASE64.decode(challenge_b64.as_bytes()).unwrap(),
        )
        .unwrap();
        let pairs = parse_digest_pairs(&challenge);
        let nonce = pairs.get("nonce").unwrap();
        assert_equal!(pairs.get("qop").unwrap(), "auth");
        assert_equal!(pairs.get("algorithm").unwrap(), "md5-sess");

        // act as the client
        let cnonce = "client-nonce";
        let response = digest_md5_response(
            "alice",
            "mx.test",
            "s3cret",
            nonce,
            cnonce,
            "00000001",
            "auth",
            "smtp/mx.test",
            "AUTHENTICATE",
        );
        let reply = format!(
            "username=\"alice\",realm=\"mx.test\",nonce=\"{nonce}\",cnonce=\"{cnonce}\",\
             nc=00000001,qop=auth,digest-uri=\"smtp/mx.test\",response={response}"
        );
        let step = mech.respond(BASE64.encode(reply.as_bytes())).await.unwrap();
        let AuthStep::Challenge(rspauth_b64) = step else {
            panic!("expected rspauth, got {step:?}");
        };
        let rspauth =
            String::from_utf8(BASE64.decode(rspauth_b64.as_bytes()).unwrap()).unwrap();
        let expected = digest_md5_response(
            "alice",
            "mx.test",
            "s3cret",
            nonce,
            cnonce,
            "00000001",
            "auth",
            "smtp/mx.test",
            "",
        );
        assert_equal!(rspauth, format!("rspauth={expected}"));

        assert_equal!(
            mech.respond(String::new()).await.unwrap(),
            AuthStep::Success {
                username: "alice".to_string()
            }
        );
    }

    #[tokio::test]
    async fn digest_md5_stale_nonce_rejected() {
        let mut mech = create_mechanism("DIGEST-MD5", "mx.test", store()).unwrap();
        mech.initial(None).await.unwrap();
        let reply = "username=\"alice\",nonce=\"not-ours\",cnonce=\"x\",nc=00000001,\
                     digest-uri=\"smtp/mx.test\",response=0123";
        assert_equal!(
            mech.respond(BASE64.encode(reply.as_bytes())).await.unwrap(),
            AuthStep::Failed
        );
    }

    #[test]
    fn nonces_are_hex_and_sized() {
        let nonce = generate_nonce(16);
        assert_equal!(nonce.len(), 32);
        assert!(nonce.bytes().all(|b| b.is_ascii_hexdigit()));
        assert!(generate_nonce(16) != nonce);
    }

    #[test]
    fn digest_pair_parsing() {
        let pairs = parse_digest_pairs(
            "username=\"alice\",realm=\"mx.test\",nc=00000001,digest-uri=\"smtp/mx.test\"",
        );
        assert_equal!(pairs.get("username").unwrap(), "alice");
        assert_equal!(pairs.get("nc").unwrap(), "00000001");
        assert_equal!(pairs.get("digest-uri").unwrap(), "smtp/mx.test");
    }

    #[test]
    fn mechanism_list_depends_on_backend() {
        let names = mechanism_names(store().as_ref());
        assert_equal!(names, vec!["PLAIN", "LOGIN", "CRAM-MD5", "DIGEST-MD5"]);
    }
}
