use async_trait::async_trait;

use crate::broker::Resource;
use crate::error::{BuildfarmError, Result};
use crate::provision::ProvisioningBackend;

/// A fixed fleet of builders that cannot grow.
///
/// Pair with [`ReleasePolicy::Recycle`](crate::config::ReleasePolicy) so
/// machines return to the pool instead of being destroyed.
#[derive(Debug, Clone, Default)]
pub struct StaticProvisioner {
    resources: Vec<Resource>,
}

impl StaticProvisioner {
    pub fn new(resources: Vec<Resource>) -> Self {
        Self { resources }
    }

    /// Parse a comma separated list of `id:host:port` entries.
    pub fn parse(list: &str) -> Result<Self> {
        let resources = list
            .split(',')
            .filter(|entry| !entry.trim().is_empty())
            .map(|entry| {
                Resource::parse(entry).ok_or_else(|| {
                    BuildfarmError::Config(format!(
                        "invalid builder '{}', expected id:host:port",
                        entry.trim()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(resources))
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }
}

#[async_trait]
impl ProvisioningBackend for StaticProvisioner {
    async fn list_active(&self) -> Result<Vec<Resource>> {
        Ok(self.resources.clone())
    }

    async fn create_one(&self) -> Result<Resource> {
        Err(BuildfarmError::Provisioning(
            "static builder pool cannot create machines".to_string(),
        ))
    }

    async fn destroy(&self, id: &str) -> Result<()> {
        tracing::debug!(resource_id = id, "Static builder released without teardown");
        Ok(())
    }

    fn can_create(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_builder_list() {
        let pool = StaticProvisioner::parse("a:10.0.0.1:8080, b:10.0.0.2:8081").unwrap();
        let ids: Vec<&str> = pool.resources().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(pool.resources()[1].port, "8081");
    }

    #[test]
    fn static_pool_cannot_create() {
        assert!(!StaticProvisioner::default().can_create());
    }

    #[test]
    fn parse_rejects_malformed_entry() {
        assert!(matches!(
            StaticProvisioner::parse("a:10.0.0.1"),
            Err(BuildfarmError::Config(_))
        ));
    }

    #[tokio::test]
    async fn fixed_fleet_cannot_grow() {
        let pool = StaticProvisioner::parse("a:h:1").unwrap();
        assert_eq!(pool.list_active().await.unwrap().len(), 1);
        assert!(pool.create_one().await.is_err());
        assert!(pool.destroy("a").await.is_ok());
    }
}
