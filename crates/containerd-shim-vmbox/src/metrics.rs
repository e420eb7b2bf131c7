//! Conversion of guest cgroup stats into the containerd metrics payload.

use containerd_shim::protos::cgroups::metrics::{
    CpuStat, CpuUsage, HugetlbStat, MemoryEntry, MemoryStat, Metrics, PidsStat,
};
use containerd_shim::protos::prost_types::Any;
use vmbox_sandbox::ContainerStats;

use crate::Result;

pub fn marshal_metrics(stats: &ContainerStats) -> Result<Any> {
    let cg = &stats.cgroup;

    let hugetlb = cg
        .hugetlb
        .iter()
        .map(|(pagesize, stat)| HugetlbStat {
            usage: stat.usage,
            max: stat.max_usage,
            failcnt: stat.failcnt,
            pagesize: pagesize.clone(),
        })
        .collect();

    let metrics = Metrics {
        hugetlb,
        pids: Some(PidsStat {
            current: cg.pids.current,
            limit: cg.pids.limit,
        }),
        cpu: Some(CpuStat {
            usage: Some(CpuUsage {
                total: cg.cpu.total_usage,
                per_cpu: cg.cpu.percpu_usage.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        memory: Some(MemoryStat {
            cache: cg.memory.cache,
            usage: Some(MemoryEntry {
                limit: cg.memory.usage.limit,
                usage: cg.memory.usage.usage,
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(Any::from_msg(&metrics).map_err(anyhow::Error::from)?)
}
