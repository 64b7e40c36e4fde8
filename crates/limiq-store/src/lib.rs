//! Durable persistence for workspaces, agents, policies, capabilities,
//! revocations, and the hash-chained audit log (spec §3, §4.5).

pub mod audit;
pub mod entities;
pub mod error;
pub mod store;

pub use audit::{append_audit_event, verify_chain, AppendAuditEvent, GENESIS_HASH};
pub use entities::{
    Agent, AgentPolicyBinding, AgentStatus, AuditEvent, BindingStatus, Capability,
    CapabilityStatus, Policy, Revocation, Workspace,
};
pub use error::StoreError;
pub use store::Store;
