//! Prometheus text exposition format.

use crate::collector::FleetSnapshot;

fn header(out: &mut String, name: &str, help: &str) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} gauge\n"));
}

/// Render a fleet snapshot as Prometheus gauges.
pub fn render_prometheus(s: &FleetSnapshot) -> String {
    let mut out = String::new();

    header(&mut out, "botshard_channels", "Channels by status.");
    for (status, count) in [
        ("active", s.channels_active),
        ("scaling", s.channels_scaling),
        ("draining", s.channels_draining),
    ] {
        out.push_str(&format!("botshard_channels{{status=\"{status}\"}} {count}\n"));
    }

    header(&mut out, "botshard_pools", "Pools by status.");
    for (status, count) in [("active", s.pools_active), ("draining", s.pools_draining)] {
        out.push_str(&format!("botshard_pools{{status=\"{status}\"}} {count}\n"));
    }

    header(&mut out, "botshard_shards", "Shard slots across all pools.");
    out.push_str(&format!("botshard_shards{{state=\"used\"}} {}\n", s.shards_used));
    out.push_str(&format!("botshard_shards{{state=\"total\"}} {}\n", s.shards_total));

    header(&mut out, "botshard_registrations", "Registrations by status.");
    for (status, count) in [
        ("pending", s.queue.pending),
        ("processing", s.queue.processing),
        ("completed", s.queue.completed),
        ("failed", s.queue.failed),
    ] {
        out.push_str(&format!("botshard_registrations{{status=\"{status}\"}} {count}\n"));
    }

    header(&mut out, "botshard_region_agents", "Agents on ACTIVE channels per region.");
    for r in &s.regions {
        out.push_str(&format!(
            "botshard_region_agents{{region=\"{}\"}} {}\n",
            r.region, r.current_agents
        ));
    }

    header(&mut out, "botshard_region_capacity", "Agent capacity of ACTIVE channels per region.");
    for r in &s.regions {
        out.push_str(&format!(
            "botshard_region_capacity{{region=\"{}\"}} {}\n",
            r.region, r.max_agents
        ));
    }

    header(&mut out, "botshard_region_utilization", "Agents over capacity per region (0.0-1.0).");
    for r in &s.regions {
        out.push_str(&format!(
            "botshard_region_utilization{{region=\"{}\"}} {:.4}\n",
            r.region, r.utilization
        ));
    }

    out
}
