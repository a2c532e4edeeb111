use anyhow::{anyhow, Context, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_config::{BehaviorVersion, Region};

/// One instance in a scaling group: its identifier and lifecycle state as the
/// service reports them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub id: String,
    pub lifecycle_state: String,
}

/// Capacity snapshot of a scaling group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCapacity {
    pub min: i32,
    pub max: i32,
    pub desired: i32,
    pub instances: Vec<InstanceInfo>,
}

/// Synchronous wrapper over the autoscaling service, used by the node-update
/// daemon to grow and shrink the worker fleet.
pub struct AsgClient {
    runtime: tokio::runtime::Runtime,
    client: aws_sdk_autoscaling::Client,
}

impl AsgClient {
    pub fn new(region: Option<String>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("Could not start async runtime for autoscaling")?;

        let config = runtime.block_on(async {
            let region_provider = RegionProviderChain::first_try(region.map(Region::new))
                .or_default_provider()
                .or_else(Region::new("us-east-1"));

            aws_config::defaults(BehaviorVersion::latest())
                .region(region_provider)
                .load()
                .await
        });

        Ok(AsgClient {
            runtime,
            client: aws_sdk_autoscaling::Client::new(&config),
        })
    }

    /// Read the current/min/max/desired capacity of a group, along with its
    /// instance identifiers and lifecycle states.
    pub fn describe_group(&self, group_name: &str) -> Result<GroupCapacity> {
        let response = self
            .runtime
            .block_on(
                self.client
                    .describe_auto_scaling_groups()
                    .auto_scaling_group_names(group_name)
                    .send(),
            )
            .map_err(|e| anyhow!("Could not describe scaling group '{}': {}", group_name, e))?;

        let group = response
            .auto_scaling_groups()
            .first()
            .ok_or_else(|| anyhow!("Scaling group '{}' does not exist", group_name))?;

        let instances = group
            .instances()
            .iter()
            .map(|instance| InstanceInfo {
                id: instance.instance_id().unwrap_or_default().to_string(),
                lifecycle_state: instance
                    .lifecycle_state()
                    .map(|s| s.as_str())
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect();

        Ok(GroupCapacity {
            min: group.min_size().unwrap_or_default(),
            max: group.max_size().unwrap_or_default(),
            desired: group.desired_capacity().unwrap_or_default(),
            instances,
        })
    }

    /// Adjust the group's desired capacity.
    pub fn set_desired_capacity(&self, group_name: &str, capacity: i32) -> Result<()> {
        self.runtime
            .block_on(
                self.client
                    .set_desired_capacity()
                    .auto_scaling_group_name(group_name)
                    .desired_capacity(capacity)
                    .send(),
            )
            .map_err(|e| {
                anyhow!("Could not set desired capacity {} on '{}': {}", capacity, group_name, e)
            })?;
        Ok(())
    }

    /// Detach instances from the group without terminating them and without
    /// decrementing the desired capacity; detachment is deliberately
    /// decoupled from scale-down termination.
    pub fn detach_instances(&self, group_name: &str, instance_ids: Vec<String>) -> Result<()> {
        self.runtime
            .block_on(
                self.client
                    .detach_instances()
                    .auto_scaling_group_name(group_name)
                    .set_instance_ids(Some(instance_ids))
                    .should_decrement_desired_capacity(false)
                    .send(),
            )
            .map_err(|e| anyhow!("Could not detach instances from '{}': {}", group_name, e))?;
        Ok(())
    }

    /// Terminate one instance by identifier, shrinking the group with it.
    pub fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        self.runtime
            .block_on(
                self.client
                    .terminate_instance_in_auto_scaling_group()
                    .instance_id(instance_id)
                    .should_decrement_desired_capacity(true)
                    .send(),
            )
            .map_err(|e| anyhow!("Could not terminate instance '{}': {}", instance_id, e))?;
        Ok(())
    }
}
