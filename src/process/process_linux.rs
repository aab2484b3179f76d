use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Context;
use cgroups_rs::{Cgroup, CgroupPid};

fn get_current_user_id() -> anyhow::Result<String> {
    let output = std::process::Command::new("id")
        .arg("-u")
        .output()
        .context("Could not launch 'id -u'")?;
    let stdout = output.stdout;
    let untrimed_id = std::str::from_utf8(&stdout).context("id is not a valid string")?;
    Ok(untrimed_id.trim().to_string())
}

fn get_cgroup_path(user_id: &str, group_name: &str) -> String {
    format!("user.slice/user-{user_id}.slice/user@{user_id}.service/{group_name}")
}

/// Creates a cgroup at `path` whose members may only run on `cpus` ("1-5,7", "1,3,4", ...).
fn create_cpuset_cgroup(path: &str, cpus: &str) -> anyhow::Result<Cgroup> {
    cgroups_rs::cgroup_builder::CgroupBuilder::new(path)
        .cpu()
        .cpus(cpus.to_string())
        .done()
        .build(cgroups_rs::hierarchies::auto())
        .context("could not create cgroup")
}

/// The cgroup an engine process is currently pinned through, if any.
#[derive(Debug, Default)]
pub(super) struct Pinning {
    cgroup: Option<Cgroup>,
}

impl Pinning {
    /// Moves `pid` into a fresh cgroup restricted to `cpus`, then drops the previous one.
    ///
    /// A new cgroup is used for every core set so that no controller has to be modified while
    /// the engine is running.
    pub(super) fn pin(&mut self, pid: u32, cpus: &str) -> anyhow::Result<()> {
        static COUNTER: AtomicU32 = AtomicU32::new(1);
        let user_id = get_current_user_id().context("could not get user id")?;
        let group_name = format!(
            "ENGINE_ARENA_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let path = get_cgroup_path(&user_id, &group_name);
        let group = create_cpuset_cgroup(&path, cpus)?;
        if let Err(e) = group.add_task_by_tgid(CgroupPid { pid: pid as u64 }) {
            let _ = group.delete();
            return Err(e).context("could not add engine process to cgroup");
        }
        if let Some(previous) = self.cgroup.replace(group) {
            if let Err(e) = previous.delete() {
                tracing::warn!("Failed to remove previous cgroup: {e}");
            }
        }
        Ok(())
    }

    /// Removes the cgroup. Must be called once the process has exited.
    pub(super) fn release(&mut self) {
        if let Some(cgroup) = self.cgroup.take() {
            if let Err(e) = cgroup.delete() {
                // Oh well... Whatever...
                tracing::warn!("Failed to remove cgroup. If this happens a lot, it may slow down the computer. {e}");
            }
        }
    }
}
