use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One uploaded card image. Several rows may share the same `image` path
/// when their uploads had identical content.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "card_images")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub uploaded_by: Option<String>,
    /// Path relative to the media root, e.g. `card_images/goblin.png`
    pub image: Option<String>,
    /// SHA-256 of the file at `image`; `None` for rows stored before hashing
    pub content_hash: Option<String>,
    pub uploaded_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::users::Entity",
        from = "Column::UploadedBy",
        to = "super::users::Column::Id",
        on_update = "Cascade",
        on_delete = "SetNull"
    )]
    Users,
}

impl Related<super::users::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Users.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
