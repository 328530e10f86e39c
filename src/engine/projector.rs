use crate::market::price_cache::PriceCache;
use crate::market::types::{
    AssetView, PortfolioSnapshot, SnapshotEntry, StreamConnectionState, MAX_FIAT_PRECISION,
};
use crate::wallet::catalog::{AssetCatalog, CatalogEntry};
use rust_decimal::Decimal;

/// Folds catalog, balances and quotes into one complete snapshot. Nothing is
/// published field by field.
#[derive(Debug, Clone)]
pub struct ViewProjector {
    fiat_precision: u32,
    sequence: u64,
}

impl ViewProjector {
    pub fn new(fiat_precision: u32) -> Self {
        Self {
            fiat_precision,
            sequence: 0,
        }
    }

    pub fn recompute(
        &mut self,
        catalog: &AssetCatalog,
        cache: &PriceCache,
        stream: StreamConnectionState,
    ) -> PortfolioSnapshot {
        let fiat = cache.fiat();
        let mut entries = Vec::with_capacity(catalog.entries().len());
        let mut total_fiat_value = Decimal::ZERO;

        for entry in catalog.entries() {
            match entry {
                CatalogEntry::Section(marker) => entries.push(SnapshotEntry::Section {
                    marker: marker.clone(),
                }),
                CatalogEntry::Asset(asset) if catalog.is_visible(&asset.symbol) => {
                    let projected_fiat_value = asset.balance.and_then(|balance| {
                        cache.convert(balance, &asset.symbol, fiat, self.fiat_precision)
                    });
                    if let Some(value) = projected_fiat_value {
                        total_fiat_value += value;
                    }
                    entries.push(SnapshotEntry::Asset(AssetView {
                        symbol: asset.symbol.clone(),
                        display_name: asset.display_name.clone(),
                        balance: asset.balance,
                        precision: asset.precision,
                        is_pivot: asset.is_pivot,
                        unit_price: cache.convert(
                            Decimal::ONE,
                            &asset.symbol,
                            fiat,
                            MAX_FIAT_PRECISION,
                        ),
                        projected_fiat_value,
                        percent_change_24h: cache.percent_change(&asset.symbol),
                    }));
                }
                CatalogEntry::Asset(_) => {}
            }
        }

        self.sequence = self.sequence.saturating_add(1);
        PortfolioSnapshot {
            sequence: self.sequence,
            display_fiat: fiat.to_string(),
            pivot: cache.pivot().to_string(),
            entries,
            total_fiat_value,
            stream,
        }
    }
}
