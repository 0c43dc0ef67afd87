pub mod prelude;

pub mod admin;
pub mod pending_email_change;
pub mod sea_orm_active_enums;
pub mod setting;
