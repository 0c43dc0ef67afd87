use sea_orm::entity::prelude::*;

use super::sea_orm_active_enums::AdminStatus;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "admin")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    #[sea_orm(unique)]
    pub email: String,

    pub password_hash: String,
    pub role: String,
    pub status: AdminStatus,

    pub reset_password_token_hash: Option<String>,
    pub reset_password_expires_at: Option<DateTimeWithTimeZone>,

    pub last_login_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
