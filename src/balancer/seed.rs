//! Declarative seeding from the configuration file.

use crate::balancer::Balancer;
use crate::balancer::undo::Steps;
use crate::config::ServiceSeed;
use crate::error::{Error, Result};
use crate::store::StoreError;
use tracing::{info, warn};

impl Balancer {
    /// Create every seeded service, destination and check that does not
    /// exist yet. Returns the number of entities created.
    ///
    /// Each seed is applied as one unit: if any of its entries fails, the
    /// entries created for that seed are removed again. Failing seeds are
    /// logged and skipped.
    pub async fn apply_seed(&self, seeds: &[ServiceSeed]) -> usize {
        let mut created = 0;
        for seed in seeds {
            match self.apply_service_seed(seed).await {
                Ok(n) => created += n,
                Err(e) => warn!(service = %seed.service.name, error = %e, "seeding service failed"),
            }
        }
        if created > 0 {
            info!(created, seeds = seeds.len(), "applied service seeds");
        }
        created
    }

    async fn apply_service_seed(&self, seed: &ServiceSeed) -> Result<usize> {
        let mut steps = Steps::new();
        match self.seed_entries(seed, &mut steps).await {
            Ok(()) => Ok(steps.len()),
            Err(e) => {
                steps.unwind().await;
                Err(e)
            }
        }
    }

    async fn seed_entries<'a>(&'a self, seed: &'a ServiceSeed, steps: &mut Steps<'a>) -> Result<()> {
        let name = seed.service.name.as_str();

        if self.state.get_service(name).is_none() {
            let svc = self.add_service(seed.service.clone()).await?;
            steps.committed("add service", async move {
                if let Err(e) = self.store.delete_service(&svc.name).await {
                    warn!(service = %svc.name, error = %e, "failed to undo service");
                }
                self.ipam.release_vip(&svc);
            });

            // Destinations and checks need the service in the State Model.
            let timeout = self.settings.propagation_timeout;
            if !self.wait_until(timeout, |s| s.get_service(name).is_some()).await {
                return Err(Error::Store(StoreError::Unavailable(format!(
                    "service '{}' did not propagate",
                    name
                ))));
            }
        }

        for dst in seed.bound_destinations() {
            if self.state.get_destination(&dst.name).is_some() {
                continue;
            }
            let dst = self.add_destination(name, dst).await?;
            steps.committed("add destination", async move {
                if let Err(e) = self.store.delete_destination(&dst.name).await {
                    warn!(destination = %dst.name, error = %e, "failed to undo destination");
                }
            });
        }

        let existing = self.state.get_checks();
        for mut spec in seed.bound_checks() {
            spec.apply_defaults(self.settings.check_interval, self.settings.check_timeout);
            if existing.iter().any(|c| c.id == spec.id) {
                continue;
            }
            let spec = self.add_check(spec).await?;
            steps.committed("add check", async move {
                if let Err(e) = self.store.delete_check(&spec.id).await {
                    warn!(check = %spec.id, error = %e, "failed to undo check");
                }
            });
        }

        Ok(())
    }
}
