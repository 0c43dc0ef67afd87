pub use super::admin::Entity as Admin;
pub use super::pending_email_change::Entity as PendingEmailChange;
pub use super::setting::Entity as Setting;
