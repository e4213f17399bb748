//! Row-level assertions against the shared database.

use tokio_postgres::Client;
use tokio_postgres::types::{ToSql, Type};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbCheckError {
    #[error("database query failed: {0}")]
    Query(#[from] tokio_postgres::Error),

    #[error("metadata is not valid JSON: {0}")]
    MetadataJson(#[from] serde_json::Error),

    #[error("cannot read icon file {path}: {source}")]
    IconRead {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("app '{0}' not found in public.eliona_app")]
    AppMissing(String),

    #[error("initialized_at of app '{0}' shouldn't be empty")]
    NotInitialized(String),

    #[error("asset type {0} not found")]
    AssetTypeMissing(String),

    #[error("attribute {attribute} for asset type {asset_type} not found")]
    AttributeMissing {
        asset_type: String,
        attribute: String,
    },

    #[error("widget type {0} not found")]
    WidgetTypeMissing(String),

    #[error("schema {0} not found")]
    SchemaMissing(String),

    #[error("table {table} for schema {schema} not found")]
    TableMissing { schema: String, table: String },
}

/// The app set its initialization marker after startup.
pub async fn app_is_initialized(client: &Client, app_name: &str) -> Result<String, DbCheckError> {
    let row = client
        .query_opt(crate::db::INITIALIZED_AT_QUERY, &[&app_name])
        .await?
        .ok_or_else(|| DbCheckError::AppMissing(app_name.to_string()))?;
    row.try_get::<_, Option<String>>(0)?
        .ok_or_else(|| DbCheckError::NotInitialized(app_name.to_string()))
}

/// Register the app in the store with its raw metadata and icon.
///
/// Returns the number of updated rows.
pub async fn register_in_store(
    client: &Client,
    app_name: &str,
    metadata_raw: &str,
    icon: &str,
) -> Result<u64, DbCheckError> {
    let statement = client
        .prepare("UPDATE eliona_store SET metadata = $1, icon = $2 WHERE app_name = $3")
        .await?;
    // JSON columns need a JSON value, text columns take the bytes as written.
    let json;
    let metadata: &(dyn ToSql + Sync) = match statement.params().first() {
        Some(ty) if *ty == Type::JSON || *ty == Type::JSONB => {
            json = serde_json::from_str::<serde_json::Value>(metadata_raw)?;
            &json
        }
        _ => &metadata_raw,
    };
    Ok(client
        .execute(&statement, &[metadata, &icon, &app_name])
        .await?)
}

async fn exists(
    client: &Client,
    query: &str,
    params: &[&(dyn ToSql + Sync)],
) -> Result<bool, DbCheckError> {
    Ok(!client.query(query, params).await?.is_empty())
}

pub async fn asset_type_exists(
    client: &Client,
    asset_type: &str,
    attributes: &[String],
) -> Result<(), DbCheckError> {
    if !exists(
        client,
        "SELECT 1 FROM public.asset_type WHERE asset_type = $1::text",
        &[&asset_type],
    )
    .await?
    {
        return Err(DbCheckError::AssetTypeMissing(asset_type.to_string()));
    }
    for attribute in attributes {
        if !exists(
            client,
            "SELECT 1 FROM public.attribute_schema WHERE asset_type = $1::text AND attribute = $2::text",
            &[&asset_type, attribute],
        )
        .await?
        {
            return Err(DbCheckError::AttributeMissing {
                asset_type: asset_type.to_string(),
                attribute: attribute.clone(),
            });
        }
    }
    Ok(())
}

pub async fn widget_type_exists(client: &Client, name: &str) -> Result<(), DbCheckError> {
    if exists(
        client,
        "SELECT 1 FROM public.widget_type WHERE widget_type.name = $1::text",
        &[&name],
    )
    .await?
    {
        Ok(())
    } else {
        Err(DbCheckError::WidgetTypeMissing(name.to_string()))
    }
}

pub async fn schema_exists(client: &Client, schema: &str, tables: &[String]) -> Result<(), DbCheckError> {
    if !exists(
        client,
        "SELECT 1 FROM information_schema.schemata WHERE schema_name = $1::text",
        &[&schema],
    )
    .await?
    {
        return Err(DbCheckError::SchemaMissing(schema.to_string()));
    }
    for table in tables {
        if !exists(
            client,
            "SELECT 1 FROM information_schema.tables WHERE table_schema = $1::text AND table_name = $2::text",
            &[&schema, table],
        )
        .await?
        {
            return Err(DbCheckError::TableMissing {
                schema: schema.to_string(),
                table: table.clone(),
            });
        }
    }
    Ok(())
}
