//! Collections the server syncs.

use larder_engine::{CollectionSchema, FieldDef, FieldType, Schema};

/// The recipe app's synced collections.
///
/// Only identifying fields are required; everything else is optional so
/// older clients keep syncing when new fields appear.
pub fn default_schema() -> Schema {
    Schema::new(1)
        .with_collection(CollectionSchema::new(
            "recipes",
            vec![
                FieldDef::required("title", FieldType::String),
                FieldDef::optional("description", FieldType::String),
                FieldDef::optional("servings", FieldType::Int),
                FieldDef::optional("prepMinutes", FieldType::Int),
                FieldDef::optional("cookMinutes", FieldType::Int),
                FieldDef::optional("rating", FieldType::Float),
                FieldDef::optional("favorite", FieldType::Bool),
                FieldDef::optional("ingredients", FieldType::Json),
                FieldDef::optional("steps", FieldType::Json),
                FieldDef::optional("tags", FieldType::Json),
                FieldDef::optional("updatedAt", FieldType::Timestamp),
            ],
        ))
        .with_collection(CollectionSchema::new(
            "collections",
            vec![
                FieldDef::required("name", FieldType::String),
                FieldDef::optional("description", FieldType::String),
                FieldDef::optional("recipeIds", FieldType::Json),
                FieldDef::optional("isPublic", FieldType::Bool),
            ],
        ))
        .with_collection(CollectionSchema::new(
            "meal_plans",
            vec![
                FieldDef::required("startDate", FieldType::Timestamp),
                FieldDef::optional("endDate", FieldType::Timestamp),
                FieldDef::optional("meals", FieldType::Json),
                FieldDef::optional("notes", FieldType::String),
            ],
        ))
        .with_collection(CollectionSchema::new(
            "shopping_lists",
            vec![
                FieldDef::required("name", FieldType::String),
                FieldDef::optional("items", FieldType::Json),
                FieldDef::optional("completed", FieldType::Bool),
            ],
        ))
}
