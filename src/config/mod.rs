pub mod schema;

pub use schema::{BrokerConfig, Config, GatewayConfig, ObservabilityConfig, CONFIG_DIR_ENV};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reexported_config_default_is_constructible() {
        let config = Config::default();

        assert!(!config.gateway.host.is_empty());
        assert!(config.broker.waiting_timeout_secs > 0);
        assert_eq!(config.observability.log_filter, "info");
    }
}
