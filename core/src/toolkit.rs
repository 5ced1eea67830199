//! One installation, fully wired: inspector output, supervisor, admin client
//! and simulation engine sharing a single event bus.

use std::path::Path;
use std::sync::Arc;

use kafka_toolkit_client::{BrokerConnector, ClientConfig, KafkaClient};
use tracing::info;

use crate::admin::AdminClient;
use crate::config::ToolkitSettings;
use crate::events::EventBus;
use crate::inspector::{BrokerConfig, ConfigInspector};
use crate::simulation::SimulationEngine;
use crate::supervisor::{BrokerState, ProcessInfo, ProcessSupervisor};
use crate::Result;

pub struct Toolkit {
    config: BrokerConfig,
    settings: ToolkitSettings,
    bus: EventBus,
    supervisor: Arc<ProcessSupervisor>,
    admin: AdminClient,
    simulation: SimulationEngine,
}

impl Toolkit {
    /// Parse the installation at `installation` and connect everything to
    /// the broker endpoints it declares.
    pub fn open<P: AsRef<Path>>(installation: P, settings: ToolkitSettings) -> Result<Self> {
        let config = ConfigInspector::new().parse(installation)?;

        let client_config = ClientConfig {
            brokers: config
                .bootstrap_endpoints
                .iter()
                .map(|endpoint| endpoint.to_string())
                .collect(),
            connection_timeout: settings.probe_connect_timeout(),
            request_timeout: settings.admin_request_timeout(),
            client_id: Some(settings.client_id.clone()),
        };
        client_config.validate()?;
        let connector = KafkaClient::new(client_config).with_delivery_timeout(settings.send_timeout());

        Self::with_connector(config, settings, Arc::new(connector))
    }

    /// Wire the components around an existing connector
    pub fn with_connector(
        config: BrokerConfig,
        settings: ToolkitSettings,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<Self> {
        settings.validate().map_err(crate::ToolkitError::Settings)?;

        let bus = EventBus::new(
            settings.event_buffer_capacity,
            settings.event_history_capacity,
        );
        let supervisor = Arc::new(ProcessSupervisor::new(settings.clone(), bus.clone()));
        let admin = AdminClient::new(
            connector.admin()?,
            supervisor.state_watch(),
            bus.clone(),
            &settings,
        )
        .with_broker_config(&config);
        let simulation =
            SimulationEngine::new(connector, supervisor.state_watch(), bus.clone(), &settings);

        info!(
            "Toolkit ready for {} ({} mode, bootstrap {})",
            config.installation_path.display(),
            config.mode,
            config.bootstrap_servers()
        );

        Ok(Self {
            config,
            settings,
            bus,
            supervisor,
            admin,
            simulation,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn settings(&self) -> &ToolkitSettings {
        &self.settings
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn admin(&self) -> &AdminClient {
        &self.admin
    }

    pub fn simulation(&self) -> &SimulationEngine {
        &self.simulation
    }

    pub fn current_state(&self) -> BrokerState {
        self.supervisor.current_state()
    }

    pub async fn start_broker(&self) -> Result<ProcessInfo> {
        Ok(self.supervisor.start(&self.config).await?)
    }

    /// Stop all simulation jobs, then the broker
    pub async fn shutdown(&self) -> Result<()> {
        let stopped = self.simulation.stop_all();
        if stopped > 0 {
            info!("Stopped {} simulation job(s)", stopped);
        }
        self.supervisor
            .stop(self.settings.graceful_stop_timeout())
            .await?;
        Ok(())
    }
}
