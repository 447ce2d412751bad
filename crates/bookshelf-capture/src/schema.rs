//! Response shapes of the storefront's GraphQL operations.
//!
//! Only the fields the pipeline reads are declared; every branch that the
//! storefront may omit is optional so that a sparse response decodes instead
//! of failing.

use serde::{Deserialize, Serialize};

use crate::types::ItemId;

/// Response of the bookshelf list operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListResponse {
    pub data: Option<ListData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListData {
    pub viewer: Option<Viewer>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewer {
    pub book_shelf_items: Option<ItemConnection>,
}

/// One page of bookshelf items.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemConnection {
    pub page_info: Option<PageInfo>,
    #[serde(default)]
    pub edges: Vec<ItemEdge>,
}

/// Cursor state of a page; informational only, pagination is scroll-driven.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub has_next_page: bool,
    #[serde(default)]
    pub end_cursor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemEdge {
    pub node: ItemNode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemNode {
    pub product: ProductRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductRef {
    #[serde(rename = "databaseID")]
    pub database_id: ItemId,
}

impl ListResponse {
    fn connection(&self) -> Option<&ItemConnection> {
        self.data.as_ref()?.viewer.as_ref()?.book_shelf_items.as_ref()
    }

    /// Identifiers carried by this page. An empty page is a valid end of data.
    pub fn item_ids(&self) -> Vec<ItemId> {
        self.connection()
            .map(|c| {
                c.edges
                    .iter()
                    .map(|e| e.node.product.database_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn page_info(&self) -> Option<&PageInfo> {
        self.connection()?.page_info.as_ref()
    }
}

/// Response of the item detail operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetailResponse {
    pub data: Option<DetailData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetailData {
    pub node: Option<DetailNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailNode {
    /// Acquisition time (ISO-8601).
    pub caused_at: String,
    pub product: DetailProduct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailProduct {
    #[serde(rename = "databaseID")]
    pub database_id: ItemId,
    pub name: String,
    pub organization: Organization,
    /// Absent when the item has no downloadable file.
    pub download_content: Option<DownloadContent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadContent {
    pub file_name: Option<String>,
    #[serde(rename = "downloadURL")]
    pub download_url: Option<String>,
}

/// The fields of a detail response the capture phase records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadableItem {
    pub id: ItemId,
    pub title: String,
    pub organization_name: String,
    pub caused_at: String,
    /// File name the storefront declares for the download, if any.
    pub file_name: Option<String>,
}

impl DetailResponse {
    /// The item, if the response carries downloadable content.
    pub fn downloadable(&self) -> Option<DownloadableItem> {
        let node = self.data.as_ref()?.node.as_ref()?;
        let content = node.product.download_content.as_ref()?;
        Some(DownloadableItem {
            id: node.product.database_id.clone(),
            title: node.product.name.clone(),
            organization_name: node.product.organization.name.clone(),
            caused_at: node.caused_at.clone(),
            file_name: content.file_name.clone(),
        })
    }

    /// Product name, for logging skipped items.
    pub fn product_name(&self) -> Option<&str> {
        Some(self.data.as_ref()?.node.as_ref()?.product.name.as_str())
    }
}
