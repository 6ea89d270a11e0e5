//! Access Tokens
//!
//! Tokens are immutable once built: duplication, identification-level
//! copies and job filtering all produce new tokens, so readers never need
//! a lock. Reference counting is plain `Arc`; the process manager layers
//! its fast-reference slot on top for the primary-token hot path.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::status::{NtStatus, PsResult};

// ============================================================================
// Identifiers
// ============================================================================

/// Security identifier, condensed to its relative id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sid(pub u64);

impl Sid {
    /// S-1-5-18, the local system account
    pub const LOCAL_SYSTEM: Sid = Sid(18);
    /// S-1-5-32-544, the administrators alias
    pub const ADMINISTRATORS: Sid = Sid(544);
    /// S-1-5-12, restricted code
    pub const RESTRICTED: Sid = Sid(12);
    /// S-1-1-0, everyone
    pub const WORLD: Sid = Sid(0x100);
}

/// Locally unique privilege identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Luid(pub u64);

impl Luid {
    pub const SE_ASSIGN_PRIMARY_TOKEN: Luid = Luid(3);
    pub const SE_TCB: Luid = Luid(7);
    pub const SE_INCREASE_BASE_PRIORITY: Luid = Luid(14);
    pub const SE_IMPERSONATE: Luid = Luid(29);
}

/// Group attribute bits
pub mod group_attributes {
    pub const SE_GROUP_MANDATORY: u32 = 0x01;
    pub const SE_GROUP_ENABLED: u32 = 0x04;
    pub const SE_GROUP_USE_FOR_DENY_ONLY: u32 = 0x10;
}

/// Privilege attribute bits
pub mod privilege_attributes {
    pub const SE_PRIVILEGE_ENABLED_BY_DEFAULT: u32 = 0x01;
    pub const SE_PRIVILEGE_ENABLED: u32 = 0x02;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidAndAttributes {
    pub sid: Sid,
    pub attributes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LuidAndAttributes {
    pub luid: Luid,
    pub attributes: u32,
}

/// Identifies the component that created a token.
#[derive(Debug, Clone, Copy)]
pub struct TokenSource {
    pub name: [u8; 8],
    pub identifier: u64,
}

impl TokenSource {
    pub const fn new(name: [u8; 8], identifier: u64) -> Self {
        Self { name, identifier }
    }

    pub const fn system() -> Self {
        Self::new(*b"*SYSTEM*", 0)
    }
}

// ============================================================================
// Token
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Primary,
    Impersonation,
}

/// SECURITY_IMPERSONATION_LEVEL, ordered by the authority it conveys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImpersonationLevel {
    Anonymous,
    Identification,
    Impersonation,
    Delegation,
}

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

fn allocate_token_id() -> u64 {
    NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed)
}

/// An access token. Immutable after construction.
pub struct Token {
    pub token_id: u64,
    /// Logon session this token belongs to
    pub authentication_id: u64,
    /// Token this one was duplicated or filtered from, zero if none
    pub parent_token_id: u64,
    pub token_type: TokenType,
    /// Meaningful only for impersonation tokens
    pub impersonation_level: ImpersonationLevel,
    pub user: Sid,
    pub groups: Vec<SidAndAttributes>,
    pub privileges: Vec<LuidAndAttributes>,
    pub restricted_sids: Vec<Sid>,
    pub source: TokenSource,
}

impl Token {
    /// Build a primary token for a logon session.
    pub fn new_primary(
        user: Sid,
        authentication_id: u64,
        groups: Vec<SidAndAttributes>,
        privileges: Vec<LuidAndAttributes>,
        source: TokenSource,
    ) -> Arc<Self> {
        Arc::new(Self {
            token_id: allocate_token_id(),
            authentication_id,
            parent_token_id: 0,
            token_type: TokenType::Primary,
            impersonation_level: ImpersonationLevel::Impersonation,
            user,
            groups,
            privileges,
            restricted_sids: Vec::new(),
            source,
        })
    }

    /// Build an impersonation token at the given level.
    pub fn new_impersonation(
        user: Sid,
        authentication_id: u64,
        level: ImpersonationLevel,
        groups: Vec<SidAndAttributes>,
        privileges: Vec<LuidAndAttributes>,
        source: TokenSource,
    ) -> Arc<Self> {
        Arc::new(Self {
            token_id: allocate_token_id(),
            authentication_id,
            parent_token_id: 0,
            token_type: TokenType::Impersonation,
            impersonation_level: level,
            user,
            groups,
            privileges,
            restricted_sids: Vec::new(),
            source,
        })
    }

    /// The token given to the initial system process.
    pub fn system() -> Arc<Self> {
        Self::new_primary(
            Sid::LOCAL_SYSTEM,
            0x3e7, // SYSTEM_LUID
            alloc::vec![
                SidAndAttributes {
                    sid: Sid::ADMINISTRATORS,
                    attributes: group_attributes::SE_GROUP_ENABLED
                        | group_attributes::SE_GROUP_MANDATORY,
                },
                SidAndAttributes {
                    sid: Sid::WORLD,
                    attributes: group_attributes::SE_GROUP_ENABLED,
                },
            ],
            alloc::vec![
                LuidAndAttributes {
                    luid: Luid::SE_TCB,
                    attributes: privilege_attributes::SE_PRIVILEGE_ENABLED,
                },
                LuidAndAttributes {
                    luid: Luid::SE_ASSIGN_PRIMARY_TOKEN,
                    attributes: privilege_attributes::SE_PRIVILEGE_ENABLED,
                },
                LuidAndAttributes {
                    luid: Luid::SE_INCREASE_BASE_PRIORITY,
                    attributes: privilege_attributes::SE_PRIVILEGE_ENABLED,
                },
                LuidAndAttributes {
                    luid: Luid::SE_IMPERSONATE,
                    attributes: privilege_attributes::SE_PRIVILEGE_ENABLED,
                },
            ],
            TokenSource::system(),
        )
    }

    /// Duplicate as a primary token (new token id, same identity).
    pub fn duplicate_primary(&self) -> Arc<Self> {
        Arc::new(Self {
            token_id: allocate_token_id(),
            authentication_id: self.authentication_id,
            parent_token_id: self.token_id,
            token_type: TokenType::Primary,
            impersonation_level: ImpersonationLevel::Impersonation,
            user: self.user,
            groups: self.groups.clone(),
            privileges: self.privileges.clone(),
            restricted_sids: self.restricted_sids.clone(),
            source: self.source,
        })
    }

    /// Member of the administrators alias, not marked deny-only.
    pub fn is_admin(&self) -> bool {
        self.groups.iter().any(|g| {
            g.sid == Sid::ADMINISTRATORS
                && g.attributes & group_attributes::SE_GROUP_USE_FOR_DENY_ONLY == 0
        })
    }

    /// Carries restricting SIDs.
    pub fn is_restricted(&self) -> bool {
        !self.restricted_sids.is_empty()
    }

    /// Whether this token was derived from `parent`.
    pub fn is_child_of(&self, parent: &Token) -> bool {
        self.parent_token_id != 0 && self.parent_token_id == parent.token_id
    }

    /// Whether the privilege is present and enabled.
    pub fn has_privilege(&self, luid: Luid) -> bool {
        self.privileges.iter().any(|p| {
            p.luid == luid && p.attributes & privilege_attributes::SE_PRIVILEGE_ENABLED != 0
        })
    }
}

// ============================================================================
// Policy operations
// ============================================================================

/// Can a server with `process_token` impersonate `client_token` at `level`?
///
/// Identification and below is always allowed (the server learns identity
/// but cannot act). Full impersonation requires same logon session, a
/// token derived from the server's own, or SeImpersonatePrivilege.
pub fn se_token_can_impersonate(
    process_token: &Token,
    client_token: &Token,
    level: ImpersonationLevel,
) -> bool {
    if level <= ImpersonationLevel::Identification {
        return true;
    }
    if client_token.authentication_id == process_token.authentication_id {
        return true;
    }
    if client_token.is_child_of(process_token) {
        return true;
    }
    process_token.has_privilege(Luid::SE_IMPERSONATE)
}

/// Copy a client token at identification level.
///
/// Used when full impersonation is denied: the caller still sees who the
/// client is, but the copy conveys no authority.
pub fn se_copy_client_token(token: &Token, level: ImpersonationLevel) -> Arc<Token> {
    Arc::new(Token {
        token_id: allocate_token_id(),
        authentication_id: token.authentication_id,
        parent_token_id: token.parent_token_id,
        token_type: TokenType::Impersonation,
        impersonation_level: level,
        user: token.user,
        groups: token.groups.clone(),
        privileges: token.privileges.clone(),
        restricted_sids: token.restricted_sids.clone(),
        source: token.source,
    })
}

// ============================================================================
// Job token filter
// ============================================================================

/// Captured filter a job applies to every token used inside it.
pub struct JobTokenFilter {
    pub sids_to_disable: Vec<Sid>,
    pub privileges_to_delete: Vec<Luid>,
    pub restricted_sids: Vec<Sid>,
}

impl JobTokenFilter {
    /// Capture a filter description. An entirely empty filter is rejected.
    pub fn capture(
        sids_to_disable: Vec<Sid>,
        privileges_to_delete: Vec<Luid>,
        restricted_sids: Vec<Sid>,
    ) -> PsResult<Arc<Self>> {
        if sids_to_disable.is_empty() && privileges_to_delete.is_empty() && restricted_sids.is_empty()
        {
            return Err(NtStatus::InvalidParameter);
        }
        Ok(Arc::new(Self {
            sids_to_disable,
            privileges_to_delete,
            restricted_sids,
        }))
    }
}

/// Produce the restricted token a job filter mandates.
///
/// Listed groups become deny-only, listed privileges are removed, and the
/// restricting SIDs are appended. The result is a primary token derived
/// from the input.
pub fn se_filter_token(token: &Token, filter: &JobTokenFilter) -> PsResult<Arc<Token>> {
    let groups = token
        .groups
        .iter()
        .map(|g| {
            if filter.sids_to_disable.contains(&g.sid) {
                SidAndAttributes {
                    sid: g.sid,
                    attributes: (g.attributes & !group_attributes::SE_GROUP_ENABLED)
                        | group_attributes::SE_GROUP_USE_FOR_DENY_ONLY,
                }
            } else {
                *g
            }
        })
        .collect();

    let privileges = token
        .privileges
        .iter()
        .filter(|p| !filter.privileges_to_delete.contains(&p.luid))
        .copied()
        .collect();

    let mut restricted = token.restricted_sids.clone();
    for sid in &filter.restricted_sids {
        if !restricted.contains(sid) {
            restricted.push(*sid);
        }
    }

    Ok(Arc::new(Token {
        token_id: allocate_token_id(),
        authentication_id: token.authentication_id,
        parent_token_id: token.token_id,
        token_type: TokenType::Primary,
        impersonation_level: ImpersonationLevel::Impersonation,
        user: token.user,
        groups,
        privileges,
        restricted_sids: restricted,
        source: token.source,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_user_token() -> Arc<Token> {
        Token::new_primary(
            Sid(1001),
            0x111,
            alloc::vec![SidAndAttributes {
                sid: Sid::WORLD,
                attributes: group_attributes::SE_GROUP_ENABLED,
            }],
            alloc::vec![],
            TokenSource::new(*b"UserInit", 1),
        )
    }

    #[test]
    fn test_system_token_is_admin() {
        let t = Token::system();
        assert!(t.is_admin());
        assert!(!t.is_restricted());
        assert!(t.has_privilege(Luid::SE_TCB));
    }

    #[test]
    fn test_child_relationship() {
        let parent = plain_user_token();
        let child = parent.duplicate_primary();
        assert!(child.is_child_of(&parent));
        assert!(!parent.is_child_of(&child));
    }

    #[test]
    fn test_can_impersonate_rules() {
        let server = Token::system();
        let other = plain_user_token();

        // Identification is always allowed
        assert!(se_token_can_impersonate(
            &other,
            &server,
            ImpersonationLevel::Identification
        ));
        // System holds SeImpersonatePrivilege
        assert!(se_token_can_impersonate(
            &server,
            &other,
            ImpersonationLevel::Impersonation
        ));
        // A plain user cannot fully impersonate a foreign session
        assert!(!se_token_can_impersonate(
            &other,
            &server,
            ImpersonationLevel::Impersonation
        ));
        // Same logon session is fine
        let sibling = se_copy_client_token(&other, ImpersonationLevel::Impersonation);
        assert!(se_token_can_impersonate(
            &other,
            &sibling,
            ImpersonationLevel::Impersonation
        ));
    }

    #[test]
    fn test_identification_copy_keeps_identity() {
        let t = Token::system();
        let copy = se_copy_client_token(&t, ImpersonationLevel::Identification);
        assert_eq!(copy.user, t.user);
        assert_eq!(copy.token_type, TokenType::Impersonation);
        assert_eq!(copy.impersonation_level, ImpersonationLevel::Identification);
        assert_ne!(copy.token_id, t.token_id);
    }

    #[test]
    fn test_filter_token() {
        let t = Token::system();
        let filter = JobTokenFilter::capture(
            alloc::vec![Sid::ADMINISTRATORS],
            alloc::vec![Luid::SE_TCB],
            alloc::vec![Sid::RESTRICTED],
        )
        .unwrap();

        let filtered = se_filter_token(&t, &filter).unwrap();
        assert!(!filtered.is_admin());
        assert!(!filtered.has_privilege(Luid::SE_TCB));
        assert!(filtered.has_privilege(Luid::SE_IMPERSONATE));
        assert!(filtered.is_restricted());
        assert!(filtered.is_child_of(&t));
        assert_eq!(filtered.token_type, TokenType::Primary);
    }

    #[test]
    fn test_empty_filter_rejected() {
        assert!(JobTokenFilter::capture(alloc::vec![], alloc::vec![], alloc::vec![]).is_err());
    }
}
