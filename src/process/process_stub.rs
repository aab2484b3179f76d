use anyhow::bail;

/// CPU pinning is only implemented on Linux.
#[derive(Debug, Default)]
pub(super) struct Pinning;

impl Pinning {
    pub(super) fn pin(&mut self, _pid: u32, _cpus: &str) -> anyhow::Result<()> {
        bail!("cpu pinning only available on linux")
    }

    pub(super) fn release(&mut self) {}
}
