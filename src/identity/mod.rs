//! Identity, role and session management shared by the web and mobile clients.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod role;
mod provider;
mod session;
mod reconciler;
mod auth;

pub use principal::{Identity, IdentityEvent, IdentityEventKind, Profile, ProfileTable};
pub use role::{normalize_role, is_lecturer_role, NormalizedRole, Portal};
pub use provider::{AuthProvider, ProfileStore, SignUpRequest};
pub use session::{SessionSnapshot, SessionStore};
pub use reconciler::RoleReconciler;
pub use auth::{validate_email, AuthService, SignedIn};
