use crate::market::types::{Asset, Pair, StreamCommand, StreamMethod, Subscription};
use std::collections::HashMap;

/// One pair per visible non-pivot asset routed through the pivot, plus the
/// fixed pivot/fiat pair last.
pub fn desired_set(visible_assets: &[Asset], pivot: &str, fiat: &str) -> Vec<Pair> {
    let mut pairs: Vec<Pair> = Vec::with_capacity(visible_assets.len() + 1);
    for asset in visible_assets {
        if asset.is_pivot || asset.symbol == pivot || asset.symbol == fiat {
            continue;
        }
        let pair = Pair::new(&asset.symbol, pivot);
        if !pairs.contains(&pair) {
            pairs.push(pair);
        }
    }
    pairs.push(Pair::new(pivot, fiat));
    pairs
}

/// Tracks the feed subscriptions for one view. Every change is a full replace,
/// never a diff, and nothing survives a reconnect.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    subscriptions: Vec<Subscription>,
    routes: HashMap<String, Pair>,
    next_request_id: u64,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn pairs(&self) -> impl Iterator<Item = &Pair> {
        self.subscriptions.iter().map(|subscription| &subscription.pair)
    }

    pub fn contains(&self, pair: &Pair) -> bool {
        self.subscriptions
            .iter()
            .any(|subscription| &subscription.pair == pair)
    }

    pub fn route(&self, stream_tag: &str) -> Option<&Pair> {
        self.routes.get(stream_tag)
    }

    /// Swaps in `desired` and returns the unsubscribe-all-old command followed
    /// by the subscribe-all-new command. Empty halves are omitted. When
    /// `connected` is false the set is recorded but left inactive.
    pub fn replace(&mut self, desired: Vec<Pair>, connected: bool) -> Vec<StreamCommand> {
        let mut commands = Vec::with_capacity(2);

        let previous: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|subscription| subscription.active)
            .map(|subscription| subscription.pair.stream_tag())
            .collect();
        if connected && !previous.is_empty() {
            commands.push(self.command(StreamMethod::Unsubscribe, previous));
        }

        self.routes = desired
            .iter()
            .map(|pair| (pair.stream_tag(), pair.clone()))
            .collect();
        self.subscriptions = desired
            .into_iter()
            .map(|pair| Subscription {
                pair,
                active: connected,
            })
            .collect();

        if connected {
            commands.extend(self.subscribe_all());
        }
        commands
    }

    /// Called on every "connected" signal: the server kept nothing, so the
    /// whole current set is sent again.
    pub fn on_connected(&mut self) -> Vec<StreamCommand> {
        for subscription in &mut self.subscriptions {
            subscription.active = true;
        }
        self.subscribe_all().into_iter().collect()
    }

    pub fn on_disconnected(&mut self) {
        for subscription in &mut self.subscriptions {
            subscription.active = false;
        }
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
        self.routes.clear();
    }

    fn subscribe_all(&mut self) -> Option<StreamCommand> {
        let params: Vec<String> = self
            .subscriptions
            .iter()
            .map(|subscription| subscription.pair.stream_tag())
            .collect();
        if params.is_empty() {
            return None;
        }
        Some(self.command(StreamMethod::Subscribe, params))
    }

    fn command(&mut self, method: StreamMethod, params: Vec<String>) -> StreamCommand {
        self.next_request_id = self.next_request_id.saturating_add(1);
        StreamCommand {
            method,
            params,
            id: self.next_request_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset(symbol: &str, is_pivot: bool) -> Asset {
        Asset {
            symbol: symbol.to_string(),
            display_name: symbol.to_string(),
            balance: None,
            precision: 8,
            is_pivot,
        }
    }

    fn tags(command: &StreamCommand) -> Vec<&str> {
        command.params.iter().map(String::as_str).collect()
    }

    #[test]
    fn desired_set_routes_non_pivot_assets_and_adds_pivot_pair() {
        let visible = vec![
            asset("BTC", false),
            asset("USDT", true),
            asset("ETH", false),
            asset("BTC", false),
        ];
        let pairs = desired_set(&visible, "USDT", "EUR");
        assert_eq!(
            pairs,
            vec![
                Pair::new("BTC", "USDT"),
                Pair::new("ETH", "USDT"),
                Pair::new("USDT", "EUR"),
            ]
        );
    }

    #[test]
    fn change_issues_full_unsubscribe_then_full_subscribe() {
        let mut manager = SubscriptionManager::new();
        let first = desired_set(&[asset("BTC", false), asset("ETH", false)], "USDT", "EUR");
        let initial = manager.replace(first, true);
        assert_eq!(initial.len(), 1);
        assert_eq!(initial[0].method, StreamMethod::Subscribe);

        let second = desired_set(&[asset("ETH", false), asset("SOL", false)], "USDT", "EUR");
        let commands = manager.replace(second, true);

        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].method, StreamMethod::Unsubscribe);
        assert_eq!(
            tags(&commands[0]),
            vec!["btcusdt@ticker", "ethusdt@ticker", "usdteur@ticker"]
        );
        assert_eq!(commands[1].method, StreamMethod::Subscribe);
        assert_eq!(
            tags(&commands[1]),
            vec!["ethusdt@ticker", "solusdt@ticker", "usdteur@ticker"]
        );
        assert!(commands[0].id < commands[1].id);
    }

    #[test]
    fn routes_follow_the_current_set() {
        let mut manager = SubscriptionManager::new();
        manager.replace(desired_set(&[asset("BTC", false)], "USDT", "EUR"), true);
        assert_eq!(manager.route("btcusdt@ticker"), Some(&Pair::new("BTC", "USDT")));

        manager.replace(desired_set(&[asset("ETH", false)], "USDT", "EUR"), true);
        assert_eq!(manager.route("btcusdt@ticker"), None);
        assert_eq!(manager.route("usdteur@ticker"), Some(&Pair::new("USDT", "EUR")));
    }

    #[test]
    fn offline_replace_records_set_and_reconnect_resubscribes() {
        let mut manager = SubscriptionManager::new();
        let commands = manager.replace(desired_set(&[asset("BTC", false)], "USDT", "EUR"), false);
        assert!(commands.is_empty());
        assert!(manager.subscriptions().iter().all(|s| !s.active));

        let resubscribe = manager.on_connected();
        assert_eq!(resubscribe.len(), 1);
        assert_eq!(resubscribe[0].method, StreamMethod::Subscribe);
        assert_eq!(tags(&resubscribe[0]), vec!["btcusdt@ticker", "usdteur@ticker"]);
        assert!(manager.subscriptions().iter().all(|s| s.active));

        manager.on_disconnected();
        let again = manager.on_connected();
        assert_eq!(tags(&again[0]), tags(&resubscribe[0]));
    }

    #[test]
    fn inactive_subscriptions_are_not_unsubscribed() {
        let mut manager = SubscriptionManager::new();
        manager.replace(desired_set(&[asset("BTC", false)], "USDT", "EUR"), true);
        manager.on_disconnected();

        let commands = manager.replace(desired_set(&[asset("ETH", false)], "USDT", "EUR"), false);
        assert!(commands.is_empty());
        assert!(manager.contains(&Pair::new("ETH", "USDT")));
    }
}
