//! Per-connection peer authorization.
//!
//! The endpoint's filesystem mode is the first gate; this module is the
//! second: the accepted peer's credentials must resolve to the service
//! principal (root or the service's own uid) or to a member of the
//! administrators group. The resolved username doubles as the rate-limit
//! identity.

use tracing::debug;

use flowgate_common::{consts, Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub uid: u32,
    pub gid: u32,
    /// Canonical username, or `uid:<n>` when the uid has no account.
    pub username: String,
}

#[cfg(unix)]
pub fn authorize_peer(uid: u32, gid: u32) -> Result<PeerIdentity> {
    let username = resolve_username(uid);
    let identity = PeerIdentity { uid, gid, username };

    if uid == 0 || uid == nix::unistd::geteuid().as_raw() {
        return Ok(identity);
    }
    if is_admin_group_member(&identity) {
        return Ok(identity);
    }
    debug!(uid, gid, user = %identity.username, "peer failed authorization");
    Err(Error::AccessDenied(format!(
        "user '{}' is not the service principal or a member of '{}'",
        identity.username,
        consts::ADMIN_GROUP
    )))
}

#[cfg(unix)]
fn resolve_username(uid: u32) -> String {
    match nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => format!("uid:{uid}"),
    }
}

#[cfg(unix)]
fn is_admin_group_member(identity: &PeerIdentity) -> bool {
    match nix::unistd::Group::from_name(consts::ADMIN_GROUP) {
        Ok(Some(group)) => {
            group.gid.as_raw() == identity.gid || group.mem.contains(&identity.username)
        }
        // No such group on this host: nobody gets in through it.
        _ => false,
    }
}

#[cfg(unix)]
#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_common::ErrorKind;

    #[test]
    fn own_uid_is_authorized() {
        let uid = nix::unistd::geteuid().as_raw();
        let gid = nix::unistd::getegid().as_raw();
        let identity = authorize_peer(uid, gid).unwrap();
        assert_eq!(identity.uid, uid);
        assert!(!identity.username.is_empty());
    }

    #[test]
    fn root_is_authorized() {
        let identity = authorize_peer(0, 0).unwrap();
        assert_eq!(identity.uid, 0);
    }

    #[test]
    fn unknown_unprivileged_uid_is_denied() {
        // A uid that exists on no sane host, with a gid that is not the
        // admin group.
        let uid = 59_999;
        if uid == nix::unistd::geteuid().as_raw() {
            return;
        }
        let err = authorize_peer(uid, 59_999).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
        let identity_in_message = format!("uid:{uid}");
        assert!(err.to_string().contains(&identity_in_message));
    }
}
