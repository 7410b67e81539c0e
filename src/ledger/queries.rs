//! GraphQL documents and a typed request builder for the ledger application.
//!
//! Every dynamic value travels in `variables`; documents are static strings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::types::{DonationView, EntityKind, ProductView, ProfileView};

pub const ALL_PROFILES_QUERY: &str = r#"
    query AllProfiles {
        allProfilesView {
            owner
            chainId
            name
            bio
            socials { name url }
        }
    }
"#;

pub const ALL_DONATIONS_QUERY: &str = r#"
    query AllDonations {
        allDonationsView {
            id
            timestamp
            fromOwner
            fromChainId
            toOwner
            toChainId
            amount
            message
        }
    }
"#;

pub const ALL_PRODUCTS_QUERY: &str = r#"
    query AllProducts {
        allProducts {
            id
            author
            authorChainId
            name
            description
            link
            dataBlobHash
            imagePreviewHash
            price
            createdAt
        }
    }
"#;

pub const DATA_BLOB_QUERY: &str = r#"
    query DataBlob($hash: String!) {
        dataBlob(hash: $hash)
    }
"#;

pub const NOTIFICATIONS_SUBSCRIPTION: &str = r#"
    subscription Notifications($chainId: ChainId!) {
        notifications(chainId: $chainId)
    }
"#;

/// A GraphQL request body: static document plus JSON variables.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLRequest {
    pub query: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<&'static str>,
    pub variables: Map<String, Value>,
}

impl GraphQLRequest {
    pub fn builder(query: &'static str) -> GraphQLRequestBuilder {
        GraphQLRequestBuilder::new(query)
    }

    /// Request fetching the full authoritative set for one entity kind
    pub fn entity_set(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Profile => Self::builder(ALL_PROFILES_QUERY)
                .with_operation_name("AllProfiles")
                .build(),
            EntityKind::Donation => Self::builder(ALL_DONATIONS_QUERY)
                .with_operation_name("AllDonations")
                .build(),
            EntityKind::Product => Self::builder(ALL_PRODUCTS_QUERY)
                .with_operation_name("AllProducts")
                .build(),
        }
    }

    pub fn data_blob(hash: &str) -> Self {
        Self::builder(DATA_BLOB_QUERY)
            .with_operation_name("DataBlob")
            .with_variable("hash", hash)
            .build()
    }

    pub fn notifications(chain_id: &str) -> Self {
        Self::builder(NOTIFICATIONS_SUBSCRIPTION)
            .with_operation_name("Notifications")
            .with_variable("chainId", chain_id)
            .build()
    }
}

/// Builder for [`GraphQLRequest`]
pub struct GraphQLRequestBuilder {
    query: &'static str,
    operation_name: Option<&'static str>,
    variables: Map<String, Value>,
}

impl GraphQLRequestBuilder {
    pub fn new(query: &'static str) -> Self {
        Self {
            query,
            operation_name: None,
            variables: Map::new(),
        }
    }

    /// Sets the operation to run when the document holds several
    pub fn with_operation_name(mut self, name: &'static str) -> Self {
        self.operation_name = Some(name);
        self
    }

    /// Binds a variable referenced by the document
    pub fn with_variable(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.variables.insert(name.to_string(), value.into());
        self
    }

    pub fn build(self) -> GraphQLRequest {
        GraphQLRequest {
            query: self.query,
            operation_name: self.operation_name,
            variables: self.variables,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AllProfilesData {
    pub all_profiles_view: Vec<ProfileView>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AllDonationsData {
    pub all_donations_view: Vec<DonationView>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AllProductsData {
    pub all_products: Vec<ProductView>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DataBlobData {
    pub data_blob: Option<Vec<u8>>,
}
