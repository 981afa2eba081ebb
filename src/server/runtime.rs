/// Container-aware CPU limit detection for sizing the tokio worker pool.
///
/// Detection order: `WRAITH_CPU_LIMIT` env var ("4" or "4000m"), cgroup
/// v2 `cpu.max`, cgroup v1 quota/period, then host CPU count. Without
/// this, tokio defaults to the host count, which over-provisions threads
/// when a container is capped at a few cores on a large host.
pub fn get_container_cpu_limit() -> usize {
    if let Ok(value) = std::env::var("WRAITH_CPU_LIMIT") {
        if let Some(cores) = parse_cpu_value(&value) {
            let threads = cores.max(1);
            eprintln!(
                "[runtime] using CPU limit from WRAITH_CPU_LIMIT: {} threads",
                threads
            );
            return threads;
        }
    }

    if let Some(cores) = cgroup_cpu_limit() {
        let threads = cores.max(1);
        eprintln!("[runtime] using cgroup CPU limit: {} threads", threads);
        return threads;
    }

    let threads = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    eprintln!("[runtime] using host CPU count: {} threads", threads);
    threads
}

fn cgroup_cpu_limit() -> Option<usize> {
    // v2 unified hierarchy: "quota period" or "max period".
    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(cores) = parse_quota_period(&max) {
            return Some(cores);
        }
    }

    // v1 legacy hierarchy: separate quota and period files.
    if let (Ok(quota), Ok(period)) = (
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us"),
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us"),
    ) {
        let joined = format!("{} {}", quota.trim(), period.trim());
        if let Some(cores) = parse_quota_period(&joined) {
            return Some(cores);
        }
    }

    None
}

/// Parse a CPU value — "4" (cores) or "4000m" (millicores).
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    if let Some(stripped) = value.strip_suffix('m') {
        stripped.parse::<usize>().ok().map(|m| m / 1000)
    } else {
        value.parse::<usize>().ok()
    }
}

/// Parse "quota period" ("max" quota means unlimited).
fn parse_quota_period(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?;
    if quota == "max" {
        return None;
    }
    let quota: i64 = quota.parse().ok()?;
    let period: i64 = period.parse().ok()?;
    if quota > 0 && period > 0 {
        Some((quota / period) as usize)
    } else {
        None
    }
}
