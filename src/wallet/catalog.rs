use crate::error::AppError;
use crate::market::types::{Asset, AssetGroup, AssetListing, BalanceReport, SectionMarker};
use crate::wallet::service::{check_response, transport_error, ApiEndpoint};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

#[async_trait]
pub trait AssetCatalogSource: Send + Sync {
    /// Groups in presentation order: owned, featured, available.
    async fn fetch_groups(&self) -> Result<Vec<AssetGroup>, AppError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum CatalogEntry {
    Section(SectionMarker),
    Asset(Asset),
}

/// Per-view list of assets, built once from the first balance snapshot.
#[derive(Debug, Clone, Default)]
pub struct AssetCatalog {
    entries: Vec<CatalogEntry>,
    pivot: String,
    visible: Option<HashSet<String>>,
}

impl AssetCatalog {
    /// Flattens the groups in order. A symbol listed in several groups keeps
    /// only its first appearance.
    pub fn build(groups: Vec<AssetGroup>, report: &BalanceReport) -> Self {
        let mut seen: HashSet<String> = HashSet::new();
        let mut entries = Vec::new();

        for group in groups {
            entries.push(CatalogEntry::Section(group.marker));
            for AssetListing {
                symbol,
                display_name,
                precision,
            } in group.assets
            {
                let symbol = symbol.trim().to_ascii_uppercase();
                if symbol.is_empty() || !seen.insert(symbol.clone()) {
                    continue;
                }
                let display_name = if display_name.trim().is_empty() {
                    symbol.clone()
                } else {
                    display_name
                };
                entries.push(CatalogEntry::Asset(Asset {
                    balance: report.balances.get(&symbol).copied(),
                    is_pivot: symbol == report.pivot_symbol,
                    symbol,
                    display_name,
                    precision,
                }));
            }
        }

        Self {
            entries,
            pivot: report.pivot_symbol.clone(),
            visible: None,
        }
    }

    pub fn pivot(&self) -> &str {
        &self.pivot
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn assets(&self) -> impl Iterator<Item = &Asset> {
        self.entries.iter().filter_map(|entry| match entry {
            CatalogEntry::Asset(asset) => Some(asset),
            CatalogEntry::Section(_) => None,
        })
    }

    pub fn asset(&self, symbol: &str) -> Option<&Asset> {
        self.assets().find(|asset| asset.symbol == symbol)
    }

    pub fn is_visible(&self, symbol: &str) -> bool {
        self.visible
            .as_ref()
            .map(|visible| visible.contains(symbol))
            .unwrap_or(true)
    }

    pub fn visible_assets(&self) -> Vec<Asset> {
        self.assets()
            .filter(|asset| self.is_visible(&asset.symbol))
            .cloned()
            .collect()
    }

    /// `None` makes every asset visible. Returns whether the visible set changed.
    pub fn set_visible(&mut self, symbols: Option<Vec<String>>) -> bool {
        let next = symbols.map(|symbols| {
            symbols
                .into_iter()
                .map(|symbol| symbol.trim().to_ascii_uppercase())
                .collect::<HashSet<_>>()
        });
        if next == self.visible {
            return false;
        }
        self.visible = next;
        true
    }

    /// Replaces every balance from the record; symbols missing from it become
    /// absent rather than keeping an older value.
    pub fn apply_balances(&mut self, balances: &HashMap<String, Decimal>) {
        for entry in &mut self.entries {
            if let CatalogEntry::Asset(asset) = entry {
                asset.balance = balances.get(&asset.symbol).copied();
            }
        }
    }

    pub fn set_pivot(&mut self, pivot: &str) -> bool {
        if pivot == self.pivot {
            return false;
        }
        self.pivot = pivot.to_string();
        for entry in &mut self.entries {
            if let CatalogEntry::Asset(asset) = entry {
                asset.is_pivot = asset.symbol == pivot;
            }
        }
        true
    }
}

#[derive(Debug, Deserialize)]
struct AssetGroupWire {
    #[serde(default)]
    section: Option<String>,
    #[serde(default)]
    assets: Vec<AssetListing>,
}

#[derive(Debug, Deserialize)]
struct AssetGroupsWire {
    #[serde(default)]
    owned: Option<AssetGroupWire>,
    #[serde(default)]
    featured: Option<AssetGroupWire>,
    #[serde(default)]
    available: Option<AssetGroupWire>,
}

impl From<AssetGroupsWire> for Vec<AssetGroup> {
    fn from(value: AssetGroupsWire) -> Self {
        [
            ("owned", value.owned),
            ("featured", value.featured),
            ("available", value.available),
        ]
        .into_iter()
        .filter_map(|(name, group)| {
            group.map(|group| AssetGroup {
                marker: SectionMarker(group.section.unwrap_or_else(|| name.to_string())),
                assets: group.assets,
            })
        })
        .collect()
    }
}

fn assets_endpoint(base_url: &str) -> String {
    format!("{base_url}/v1/wallet/assets")
}

pub struct HttpAssetCatalogSource {
    client: Client,
    endpoint: ApiEndpoint,
}

impl HttpAssetCatalogSource {
    pub fn new(client: Client, endpoint: ApiEndpoint) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl AssetCatalogSource for HttpAssetCatalogSource {
    async fn fetch_groups(&self) -> Result<Vec<AssetGroup>, AppError> {
        let mut request = self.client.get(assets_endpoint(&self.endpoint.base_url));
        if let Some(token) = self.endpoint.token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(transport_error)?;
        let payload = check_response(response)
            .await?
            .json::<AssetGroupsWire>()
            .await?;
        Ok(payload.into())
    }
}
