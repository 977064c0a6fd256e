//! Parsers for `/proc` and `/sys` files.
//!
//! Pure functions over file content so they can be tested with string inputs.

use crate::error::CollectError;

/// Jiffies spent in each CPU state, as listed in `/proc/stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    pub fn busy(&self) -> u64 {
        self.total() - self.idle - self.iowait
    }

    /// Difference against an earlier reading. Counter resets clamp to zero.
    pub fn since(&self, earlier: &CpuTimes) -> CpuTimes {
        CpuTimes {
            user: self.user.saturating_sub(earlier.user),
            nice: self.nice.saturating_sub(earlier.nice),
            system: self.system.saturating_sub(earlier.system),
            idle: self.idle.saturating_sub(earlier.idle),
            iowait: self.iowait.saturating_sub(earlier.iowait),
            irq: self.irq.saturating_sub(earlier.irq),
            softirq: self.softirq.saturating_sub(earlier.softirq),
            steal: self.steal.saturating_sub(earlier.steal),
        }
    }

    pub fn add(&mut self, other: &CpuTimes) {
        self.user += other.user;
        self.nice += other.nice;
        self.system += other.system;
        self.idle += other.idle;
        self.iowait += other.iowait;
        self.irq += other.irq;
        self.softirq += other.softirq;
        self.steal += other.steal;
    }
}

/// Single CPU line from `/proc/stat`.
#[derive(Debug, Clone, Default)]
pub struct CpuStat {
    pub cpu_id: Option<u32>, // None for aggregate "cpu" line
    pub times: CpuTimes,
}

/// Parses the `cpu*` lines of `/proc/stat`.
pub fn parse_cpu_stat(content: &str) -> Result<Vec<CpuStat>, CollectError> {
    let mut cpus = Vec::new();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(name) = parts.first() else {
            continue;
        };
        if !name.starts_with("cpu") {
            continue;
        }

        let cpu_id = if *name == "cpu" {
            None
        } else {
            let id = name
                .strip_prefix("cpu")
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| CollectError::Parse(format!("invalid cpu name '{}'", name)))?;
            Some(id)
        };

        if parts.len() < 5 {
            return Err(CollectError::Parse(format!(
                "not enough fields for {}: expected 4+, got {}",
                name,
                parts.len() - 1
            )));
        }

        let get_val = |idx: usize| -> u64 { parts.get(idx).and_then(|s| s.parse().ok()).unwrap_or(0) };

        cpus.push(CpuStat {
            cpu_id,
            times: CpuTimes {
                user: get_val(1),
                nice: get_val(2),
                system: get_val(3),
                idle: get_val(4),
                iowait: get_val(5),
                irq: get_val(6),
                softirq: get_val(7),
                steal: get_val(8),
            },
        });
    }

    if cpus.is_empty() {
        return Err(CollectError::Parse("no cpu lines in /proc/stat".to_string()));
    }

    Ok(cpus)
}

/// Parses a single integer sysfs attribute such as `physical_package_id`.
pub fn parse_sysfs_u32(content: &str) -> Option<u32> {
    content.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_stat() {
        let content = "\
cpu  4000 400 2000 12000 800 200 400 0 0 0
cpu0 1000 100 500 3000 200 50 100 0 0 0
cpu1 1000 100 500 3000 200 50 100 7 0 0
intr 1000000 50 0
ctxt 500000
";
        let cpus = parse_cpu_stat(content).unwrap();
        assert_eq!(cpus.len(), 3);
        assert_eq!(cpus[0].cpu_id, None);
        assert_eq!(cpus[0].times.idle, 12000);
        assert_eq!(cpus[2].cpu_id, Some(1));
        assert_eq!(cpus[2].times.steal, 7);
    }

    #[test]
    fn test_parse_cpu_stat_old_kernel_short_line() {
        // Pre-2.6 kernels only report four columns.
        let cpus = parse_cpu_stat("cpu 10 20 30 40\n").unwrap();
        assert_eq!(cpus[0].times.total(), 100);
        assert_eq!(cpus[0].times.iowait, 0);
    }

    #[test]
    fn test_parse_cpu_stat_rejects_garbage() {
        assert!(parse_cpu_stat("ctxt 5\n").is_err());
        assert!(parse_cpu_stat("cpuX 1 2 3 4\n").is_err());
        assert!(parse_cpu_stat("cpu0 1 2\n").is_err());
    }

    #[test]
    fn test_cpu_times_since_and_busy() {
        let earlier = CpuTimes {
            user: 100,
            idle: 100,
            ..CpuTimes::default()
        };
        let later = CpuTimes {
            user: 150,
            system: 10,
            idle: 140,
            iowait: 0,
            ..CpuTimes::default()
        };
        let delta = later.since(&earlier);
        assert_eq!(delta.total(), 100);
        assert_eq!(delta.busy(), 60);

        // Reset: later is smaller than earlier.
        assert_eq!(earlier.since(&later).user, 0);
    }

    #[test]
    fn test_parse_sysfs_u32() {
        assert_eq!(parse_sysfs_u32("1\n"), Some(1));
        assert_eq!(parse_sysfs_u32("x"), None);
    }
}
