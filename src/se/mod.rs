//! Security Reference Monitor (se)
//!
//! Token model consumed by the process manager: primary/impersonation
//! token types, impersonation-level policy, identification-level copies,
//! and job token filtering.

pub mod token;

pub use token::{
    se_copy_client_token, se_filter_token, se_token_can_impersonate, ImpersonationLevel,
    JobTokenFilter, Luid, LuidAndAttributes, Sid, SidAndAttributes, Token, TokenSource, TokenType,
};
