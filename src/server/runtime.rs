/// Container-aware sizing for the tokio worker pool.
///
/// In a container limited to a few cores on a large host, tokio's default of
/// one worker per host CPU over-provisions threads badly. Preference order:
/// explicit `STEERD_WORKER_THREADS`, cgroup v2 `cpu.max`, cgroup v1 cfs
/// quota, host CPU count.
pub fn worker_threads() -> usize {
    if let Ok(value) = std::env::var("STEERD_WORKER_THREADS") {
        if let Ok(threads) = value.trim().parse::<usize>() {
            return threads.max(1);
        }
    }

    if let Some(cores) = cgroup_cpu_limit() {
        return cores.max(1);
    }

    std::thread::available_parallelism().map(|p| p.get()).unwrap_or(1)
}

fn cgroup_cpu_limit() -> Option<usize> {
    if let Ok(content) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        return cpu_quota_v2(&content);
    }
    let quota = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us").ok()?;
    let period = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us").ok()?;
    cpu_quota_v1(&quota, &period)
}

/// cgroup v2 `cpu.max` holds "quota period" or "max period".
fn cpu_quota_v2(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period: i64 = parts.next()?.parse().ok()?;
    if quota == "max" {
        return None; // unlimited
    }
    let quota: i64 = quota.parse().ok()?;
    (quota > 0 && period > 0).then(|| (quota / period) as usize)
}

fn cpu_quota_v1(quota: &str, period: &str) -> Option<usize> {
    let quota: i64 = quota.trim().parse().ok()?;
    let period: i64 = period.trim().parse().ok()?;
    (quota > 0 && period > 0).then(|| (quota / period) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_quota_v2() {
        assert_eq!(cpu_quota_v2("400000 100000"), Some(4));
        assert_eq!(cpu_quota_v2("100000 100000"), Some(1));
        assert_eq!(cpu_quota_v2("max 100000"), None);
        assert_eq!(cpu_quota_v2(""), None);
    }

    #[test]
    fn test_cpu_quota_v1() {
        assert_eq!(cpu_quota_v1("200000", "100000"), Some(2));
        assert_eq!(cpu_quota_v1("-1", "100000"), None);
        assert_eq!(cpu_quota_v1("0\n", "100000\n"), None);
    }
}
