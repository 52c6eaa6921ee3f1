use crate::collectors::{builtin_factories, CollectorContext, ComponentKind, EnergyCollector};
use crate::utils::errors::{Result, TrackerError};
use log::{info, warn};

/// A monitored hardware component and the collector reading it.
pub struct Component {
    kind: ComponentKind,
    collector: Box<dyn EnergyCollector>,
    /// Backends tried in order when `collector` fails to initialize
    fallbacks: Vec<Box<dyn EnergyCollector>>,
    devices: Vec<String>,
}

impl Component {
    pub fn new(kind: ComponentKind, collector: Box<dyn EnergyCollector>) -> Self {
        Self::with_fallbacks(kind, collector, Vec::new())
    }

    pub fn with_fallbacks(
        kind: ComponentKind,
        collector: Box<dyn EnergyCollector>,
        fallbacks: Vec<Box<dyn EnergyCollector>>,
    ) -> Self {
        Self {
            kind,
            collector,
            fallbacks,
            devices: Vec::new(),
        }
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    /// Devices found by `init`; empty before.
    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    pub fn collector_name(&self) -> &str {
        self.collector.name()
    }

    /// Initializes the collector, moving down the fallback list until one
    /// succeeds. Every failed collector is shut down; the last error is
    /// returned when none is left.
    pub async fn init(&mut self) -> Result<()> {
        loop {
            match self.collector.init().await {
                Ok(()) => {
                    self.devices = self.collector.devices();
                    self.fallbacks.clear();
                    info!("Using {} collector for {}: {:?}", self.collector_name(), self.kind, self.devices);
                    return Ok(());
                }
                Err(e) => {
                    self.shutdown().await;
                    if self.fallbacks.is_empty() {
                        return Err(e);
                    }
                    let next = self.fallbacks.remove(0);
                    warn!(
                        "{} collector for {} failed ({}); trying {}",
                        self.collector_name(),
                        self.kind,
                        e,
                        next.name()
                    );
                    self.collector = next;
                }
            }
        }
    }

    pub async fn power_usage(&mut self) -> Result<Vec<f64>> {
        let watts = self.collector.power_usage().await?;
        if watts.len() != self.devices.len() {
            return Err(TrackerError::measurement(
                self.kind.as_str(),
                format!(
                    "{} returned {} readings for {} devices",
                    self.collector.name(),
                    watts.len(),
                    self.devices.len()
                ),
            ));
        }
        Ok(watts)
    }

    pub async fn shutdown(&mut self) {
        if let Err(e) = self.collector.shutdown().await {
            warn!("Failed to shut down {} ({}): {}", self.kind, self.collector.name(), e);
        }
    }
}

/// Parses a component filter: `all` or a comma-separated list of names.
pub fn parse_filter(filter: &str) -> Result<Vec<ComponentKind>> {
    let filter = filter.trim().replace(' ', "");
    if filter.eq_ignore_ascii_case("all") {
        return Ok(ComponentKind::ALL.to_vec());
    }
    let mut kinds = Vec::new();
    for name in filter.split(',').filter(|name| !name.is_empty()) {
        let kind = ComponentKind::from_name(name).ok_or_else(|| {
            TrackerError::InvalidConfig(format!("no component found with name '{name}'"))
        })?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    if kinds.is_empty() {
        return Err(TrackerError::InvalidConfig("empty component filter".to_string()));
    }
    Ok(kinds)
}

/// Collects the available built-in backends for every requested component,
/// in priority order. Components without one are logged and left out.
pub fn create_components(filter: &str, ctx: &CollectorContext) -> Result<Vec<Component>> {
    let mut components = Vec::new();
    for kind in parse_filter(filter)? {
        let mut available = builtin_factories(kind)
            .into_iter()
            .map(|factory| factory(ctx))
            .filter(|collector| collector.is_available());
        match available.next() {
            Some(collector) => {
                info!("Selected {} collector for {}", collector.name(), kind);
                components.push(Component::with_fallbacks(kind, collector, available.collect()));
            }
            None => warn!("{}", TrackerError::unavailable(kind.as_str(), "no supported backend found")),
        }
    }
    Ok(components)
}

/// Initializes every component, skipping those whose backends all fail.
/// Fails only if none is left.
pub async fn init_components(components: Vec<Component>) -> Result<Vec<Component>> {
    let mut ready = Vec::with_capacity(components.len());
    for mut component in components {
        match component.init().await {
            Ok(()) => ready.push(component),
            Err(e) => warn!("Skipping {}: {}", component.kind, e),
        }
    }
    if ready.is_empty() {
        return Err(TrackerError::AllHandlersUnavailable);
    }
    Ok(ready)
}

pub async fn shutdown_components(components: &mut [Component]) {
    for component in components.iter_mut() {
        component.shutdown().await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::collectors::{Rapl, SimulatedCollector, TdpEstimate};
    use async_trait::async_trait;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Collector whose `init` always fails; counts shutdown calls.
    pub(crate) struct BrokenCollector {
        pub shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EnergyCollector for BrokenCollector {
        fn name(&self) -> &str {
            "broken"
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn init(&mut self) -> Result<()> {
            Err(TrackerError::unavailable("gpu", "driver missing"))
        }

        fn devices(&self) -> Vec<String> {
            Vec::new()
        }

        async fn power_usage(&mut self) -> Result<Vec<f64>> {
            Err(TrackerError::measurement("gpu", "not initialized"))
        }

        async fn shutdown(&mut self) -> Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Collector that reports `watts` for `good_reads` polls, then fails.
    pub(crate) struct FailingCollector {
        pub watts: f64,
        pub good_reads: usize,
        pub shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EnergyCollector for FailingCollector {
        fn name(&self) -> &str {
            "failing"
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn init(&mut self) -> Result<()> {
            Ok(())
        }

        fn devices(&self) -> Vec<String> {
            vec!["flaky:0".to_string()]
        }

        async fn power_usage(&mut self) -> Result<Vec<f64>> {
            if self.good_reads == 0 {
                return Err(TrackerError::measurement("cpu", "counter vanished"));
            }
            self.good_reads -= 1;
            Ok(vec![self.watts])
        }

        async fn shutdown(&mut self) -> Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_parse_filter() {
        assert_eq!(parse_filter("all").unwrap(), vec![ComponentKind::Gpu, ComponentKind::Cpu]);
        assert_eq!(parse_filter(" cpu ").unwrap(), vec![ComponentKind::Cpu]);
        assert_eq!(
            parse_filter("cpu, gpu,cpu").unwrap(),
            vec![ComponentKind::Cpu, ComponentKind::Gpu]
        );
        assert!(matches!(parse_filter("tpu"), Err(TrackerError::InvalidConfig(_))));
        assert!(parse_filter(",").is_err());
    }

    #[test]
    fn test_cpu_always_resolves() {
        let components = create_components("cpu", &CollectorContext::default()).unwrap();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].kind(), ComponentKind::Cpu);
    }

    #[tokio::test]
    async fn test_init_skips_broken_components() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let components = vec![
            Component::new(
                ComponentKind::Gpu,
                Box::new(BrokenCollector {
                    shutdowns: Arc::clone(&shutdowns),
                }),
            ),
            Component::new(
                ComponentKind::Cpu,
                Box::new(SimulatedCollector::new("Sim CPU", 100.0, 0.5).unwrap()),
            ),
        ];
        let ready = init_components(components).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].devices(), ["Sim CPU".to_string()]);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_init_fails_when_nothing_is_left() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let components = vec![Component::new(
            ComponentKind::Gpu,
            Box::new(BrokenCollector {
                shutdowns: Arc::clone(&shutdowns),
            }),
        )];
        assert!(matches!(
            init_components(components).await,
            Err(TrackerError::AllHandlersUnavailable)
        ));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_init_falls_back_to_next_backend() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let mut component = Component::with_fallbacks(
            ComponentKind::Gpu,
            Box::new(BrokenCollector {
                shutdowns: Arc::clone(&shutdowns),
            }),
            vec![
                Box::new(BrokenCollector {
                    shutdowns: Arc::clone(&shutdowns),
                }),
                Box::new(SimulatedCollector::new("Sim GPU", 200.0, 1.0).unwrap()),
            ],
        );
        component.init().await.unwrap();
        assert_eq!(component.collector_name(), "simulated");
        assert_eq!(component.devices(), ["Sim GPU".to_string()]);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreadable_rapl_counter_falls_back_to_tdp() {
        // Zones are listed but the counter cannot be read
        let root = tempfile::TempDir::new().unwrap();
        let zone = root.path().join("intel-rapl:0");
        fs::create_dir_all(zone.join("energy_uj")).unwrap();
        fs::write(zone.join("name"), "package-0\n").unwrap();

        let rapl = Rapl::new(Some(root.path().to_path_buf()));
        assert!(rapl.is_available());
        let components = vec![Component::with_fallbacks(
            ComponentKind::Cpu,
            Box::new(rapl),
            vec![Box::new(TdpEstimate::with_brand("AMD EPYC 7742"))],
        )];
        let ready = init_components(components).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].collector_name(), "tdp-estimate");
        assert_eq!(ready[0].devices(), ["AMD EPYC 7742".to_string()]);
    }

    #[tokio::test]
    async fn test_reading_count_must_match_devices() {
        let mut component = Component::new(
            ComponentKind::Cpu,
            Box::new(SimulatedCollector::new("Sim CPU", 10.0, 1.0).unwrap()),
        );
        // Not initialized: no devices known yet
        assert!(component.power_usage().await.is_err());
    }
}
