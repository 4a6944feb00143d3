use agentstack_cloud::{ConfigStore, MemoryProvider, RetryConfig, TeardownReport};
use agentstack_deploy::{
    EmptyPrompt, ProvisionOutcome, Provisioner, RemoteSetup, RemoteTimings, Result, RunConfig,
    SecretPrompt, StageTimings, StaticProbe, Teardown, TeardownTimings,
};
use tempfile::TempDir;

pub const PROJECT: &str = "demo";
pub const REGION: &str = "us-west-2";
pub const ACCOUNT: &str = "123456789012";

/// A memory-backed environment with a throwaway config directory
pub struct TestEnv {
    pub provider: MemoryProvider,
    pub dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_provider(MemoryProvider::new())
    }

    pub fn with_provider(provider: MemoryProvider) -> Self {
        Self {
            provider,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn run_config(&self) -> RunConfig {
        RunConfig::new(PROJECT, REGION, ACCOUNT)
    }

    pub fn store(&self) -> ConfigStore {
        ConfigStore::new(self.dir.path().join("application").join("config.json"))
    }

    pub async fn provision(&self) -> Result<ProvisionOutcome> {
        self.provision_with(&EmptyPrompt).await
    }

    pub async fn provision_with(&self, prompt: &dyn SecretPrompt) -> Result<ProvisionOutcome> {
        let probe = StaticProbe(200);
        Provisioner::new(&self.provider, self.run_config(), self.store(), prompt, &probe)
            .with_timings(StageTimings::immediate())
            .with_retry(RetryConfig::immediate(3))
            .run()
            .await
    }

    #[allow(dead_code)]
    pub async fn teardown(&self) -> TeardownReport {
        Teardown::new(&self.provider, self.run_config())
            .with_timings(TeardownTimings::immediate())
            .run()
            .await
    }

    #[allow(dead_code)]
    pub fn remote(&self) -> RemoteSetup<'_> {
        RemoteSetup::new(&self.provider, &self.provider, self.run_config(), self.store())
            .with_timings(RemoteTimings::immediate())
    }
}
