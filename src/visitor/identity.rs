use anyhow::{anyhow, Result};
use base64::prelude::*;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::net::IpAddr;

/// Turns a client IP into the identifier stored in the visit log
///
/// Without a salt the identifier is the textual IP, exactly what the log
/// format expects. With a salt it is `base64url(HMAC-SHA256(salt, ip))`:
/// stable per address, but raw addresses never reach disk.
#[derive(Clone)]
pub struct VisitorIdentity {
    mac: Option<Hmac<Sha256>>,
}

impl VisitorIdentity {
    pub fn new(salt: Option<&str>) -> Result<Self> {
        let mac = match salt.filter(|s| !s.is_empty()) {
            Some(salt) => Some(
                Hmac::<Sha256>::new_from_slice(salt.as_bytes())
                    .map_err(|e| anyhow!("Failed to create HMAC: {}", e))?,
            ),
            None => None,
        };
        Ok(Self { mac })
    }

    pub fn is_pseudonymized(&self) -> bool {
        self.mac.is_some()
    }

    pub fn identify(&self, ip: IpAddr) -> String {
        match &self.mac {
            None => ip.to_string(),
            Some(mac) => {
                let mut mac = mac.clone();
                mac.update(ip.to_string().as_bytes());
                BASE64_URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
            }
        }
    }
}

impl std::fmt::Debug for VisitorIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisitorIdentity")
            .field("pseudonymized", &self.is_pseudonymized())
            .finish()
    }
}
