//! JID (Jabber-like ID) types.
//!
//! JIDs identify users, devices, groups and broadcast lists. Two address
//! spaces coexist: the phone-number space (`s.whatsapp.net`) and the opaque
//! LID space (`lid`); a user generally has an address in both.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Known JID servers.
pub mod servers {
    pub const DEFAULT_USER: &str = "s.whatsapp.net";
    pub const GROUP: &str = "g.us";
    pub const LEGACY_USER: &str = "c.us";
    pub const BROADCAST: &str = "broadcast";
    pub const HIDDEN_USER: &str = "lid";
    pub const NEWSLETTER: &str = "newsletter";
    pub const CALL: &str = "call";
}

/// MessageID is the internal ID of a message.
pub type MessageID = String;

/// JID represents a user, device, group or broadcast address.
///
/// Regular JIDs carry only user and server; AD-JIDs additionally carry an
/// agent and a device number identifying one linked device of a user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct JID {
    pub user: String,
    pub agent: u8,
    pub device: u16,
    pub integrator: u16,
    pub server: String,
}

impl JID {
    /// Creates a new regular JID.
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
            ..Default::default()
        }
    }

    /// Creates a new AD-JID with agent and device on the default user server.
    pub fn new_ad(user: impl Into<String>, agent: u8, device: u16) -> Self {
        Self {
            user: user.into(),
            agent,
            device,
            integrator: 0,
            server: servers::DEFAULT_USER.to_string(),
        }
    }

    /// Returns a copy with agent and device cleared (the "user JID").
    pub fn to_non_ad(&self) -> Self {
        Self {
            user: self.user.clone(),
            server: self.server.clone(),
            integrator: self.integrator,
            ..Default::default()
        }
    }

    /// Returns a copy addressing a specific device of the same user.
    pub fn with_device(&self, device: u16) -> Self {
        let mut jid = self.clone();
        jid.device = device;
        jid
    }

    pub fn is_empty(&self) -> bool {
        self.server.is_empty()
    }

    pub fn is_group(&self) -> bool {
        self.server == servers::GROUP
    }

    pub fn is_broadcast(&self) -> bool {
        self.server == servers::BROADCAST
    }

    pub fn is_status_broadcast(&self) -> bool {
        self.server == servers::BROADCAST && self.user == "status"
    }

    /// True for addresses in the opaque LID space.
    pub fn is_lid(&self) -> bool {
        self.server == servers::HIDDEN_USER
    }

    /// The user part used for Signal protocol addresses. LID users are
    /// suffixed so phone and LID sessions never collide.
    pub fn signal_user(&self) -> String {
        if self.is_lid() {
            format!("{}_1", self.user)
        } else if self.agent != 0 {
            format!("{}_{}", self.user, self.agent)
        } else {
            self.user.clone()
        }
    }
}

impl fmt::Display for JID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.agent > 0 {
            write!(f, "{}.{}:{}@{}", self.user, self.agent, self.device, self.server)
        } else if self.device > 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server)
        } else if !self.user.is_empty() {
            write!(f, "{}@{}", self.user, self.server)
        } else {
            write!(f, "{}", self.server)
        }
    }
}

/// Error type for JID parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseJIDError(pub String);

impl fmt::Display for ParseJIDError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse JID: {}", self.0)
    }
}

impl std::error::Error for ParseJIDError {}

impl FromStr for JID {
    type Err = ParseJIDError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user_str, server) = match s.split_once('@') {
            Some((u, srv)) => (u, srv),
            None => return Ok(JID::new("", s)),
        };

        let mut jid = JID {
            user: user_str.to_string(),
            server: server.to_string(),
            ..Default::default()
        };

        if let Some((user, ad)) = user_str.split_once('.') {
            // AD format: user.agent:device@server
            jid.user = user.to_string();
            let (agent, device) = match ad.split_once(':') {
                Some((a, d)) => (a, Some(d)),
                None => (ad, None),
            };
            jid.agent = agent
                .parse()
                .map_err(|_| ParseJIDError(format!("bad agent in {s:?}")))?;
            if let Some(d) = device {
                jid.device = d
                    .parse()
                    .map_err(|_| ParseJIDError(format!("bad device in {s:?}")))?;
            }
        } else if let Some((user, device)) = user_str.split_once(':') {
            jid.user = user.to_string();
            jid.device = device
                .parse()
                .map_err(|_| ParseJIDError(format!("bad device in {s:?}")))?;
        }

        Ok(jid)
    }
}

lazy_static::lazy_static! {
    pub static ref EMPTY_JID: JID = JID::default();
    pub static ref SERVER_JID: JID = JID::new("", servers::DEFAULT_USER);
    pub static ref GROUP_SERVER_JID: JID = JID::new("", servers::GROUP);
    pub static ref BROADCAST_SERVER_JID: JID = JID::new("", servers::BROADCAST);
    pub static ref STATUS_BROADCAST_JID: JID = JID::new("status", servers::BROADCAST);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_jid() {
        let jid: JID = "1234567890@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.user, "1234567890");
        assert_eq!(jid.server, servers::DEFAULT_USER);
        assert_eq!(jid.device, 0);
        assert_eq!(jid.agent, 0);
    }

    #[test]
    fn parse_device_jid() {
        let jid: JID = "1234567890:2@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.device, 2);
        assert_eq!(jid.to_string(), "1234567890:2@s.whatsapp.net");
    }

    #[test]
    fn parse_ad_jid() {
        let jid: JID = "1234567890.1:3@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.agent, 1);
        assert_eq!(jid.device, 3);
        assert_eq!(jid.to_string(), "1234567890.1:3@s.whatsapp.net");
    }

    #[test]
    fn roundtrip_display_parse() {
        for s in [
            "1234567890@s.whatsapp.net",
            "1234567890:31@s.whatsapp.net",
            "123456789-1234567890@g.us",
            "status@broadcast",
            "98765432109876@lid",
        ] {
            let jid: JID = s.parse().unwrap();
            assert_eq!(jid.to_string(), s);
        }
    }

    #[test]
    fn non_ad_projection() {
        let jid: JID = "1234567890:2@s.whatsapp.net".parse().unwrap();
        let bare = jid.to_non_ad();
        assert_eq!(bare.device, 0);
        assert_eq!(bare.user, jid.user);
    }

    #[test]
    fn signal_user_spaces_do_not_collide() {
        let pn = JID::new("1234567890", servers::DEFAULT_USER);
        let lid = JID::new("1234567890", servers::HIDDEN_USER);
        assert_ne!(pn.signal_user(), lid.signal_user());
    }
}
