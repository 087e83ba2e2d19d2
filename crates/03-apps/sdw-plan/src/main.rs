//! Command-line planner: loads a topology, drives its streams through the
//! allocation engine against the simulated controller, and prints the
//! resulting bus layout.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use sdw_bus::{frame, SdwCore, StreamTag};
use sdw_sim::{SimHost, System, Topology};
use std::path::{Path, PathBuf};

/// Text rendering helpers used by the CLI commands.
mod render {
    use sdw_bus::{
        BusId, BusParams, Direction, MasterRuntime, PortRuntime, RowColPair, StreamTag, Target,
    };
    use sdw_sim::HostEvent;

    /// Format a bus's clock, frame shape, and the layout of every stream on it.
    pub fn plan(
        id: BusId,
        params: &BusParams,
        masters: &[MasterRuntime],
        names: &[(String, StreamTag)],
    ) -> String {
        let mut out = format!(
            "{id}: {} Hz (gear {}), frame {}x{} at {} Hz, bank {}\n",
            params.curr_dr_clk_freq,
            params.clk_div,
            params.row,
            params.col,
            params.frame_freq,
            params.active_bank.index()
        );
        out.push_str(&format!(
            "  {} bit/s, stream interval {}, system interval {}\n",
            params.bandwidth, params.stream_interval, params.system_interval
        ));
        for m_rt in masters {
            let name = names
                .iter()
                .find(|(_, tag)| *tag == m_rt.stream)
                .map_or("?", |(name, _)| name.as_str());
            let sp = &m_rt.stream_params;
            let state = format!("{:?}", m_rt.state).to_lowercase();
            out.push_str(&format!(
                "  {name} ({}) {} {state}: {} Hz, {} ch, {} bit\n",
                m_rt.stream,
                direction(m_rt.direction),
                sp.rate,
                sp.channel_count,
                sp.bps
            ));
            for port in &m_rt.ports {
                out.push_str(&port_line("master", port));
            }
            for s_rt in &m_rt.slaves {
                let label = format!("dev{}", s_rt.dev);
                for port in &s_rt.ports {
                    out.push_str(&port_line(&label, port));
                }
            }
        }
        out
    }

    fn port_line(label: &str, port: &PortRuntime) -> String {
        let tp = &port.transport_params;
        let head = format!("    {label} dp{} ch {:#04x}", port.port_num, port.channel_mask);
        if tp.valid {
            format!(
                "{head}: interval {}, offset {}, columns {}..={}\n",
                tp.sample_interval,
                tp.block_offset(),
                tp.hstart,
                tp.hstop
            )
        } else {
            format!("{head}: idle\n")
        }
    }

    fn direction(direction: Direction) -> &'static str {
        match direction {
            Direction::Tx => "tx",
            Direction::Rx => "rx",
        }
    }

    /// Format frame shapes in search order.
    pub fn catalog(pairs: &[RowColPair]) -> String {
        pairs
            .iter()
            .map(|pair| format!("{}x{}: {} data bits\n", pair.row, pair.col, pair.data_bits))
            .collect()
    }

    /// Format the controller operations recorded by the simulated host.
    pub fn events(events: &[HostEvent]) -> String {
        events.iter().map(|ev| format!("{}\n", event(ev))).collect()
    }

    fn event(event: &HostEvent) -> String {
        match *event {
            HostEvent::PortParams { bus, port, bank } => {
                format!("{bus} master dp{port} port params, bank {}", bank.index())
            }
            HostEvent::TransportParams { bus, port, bank } => {
                format!("{bus} master dp{port} transport params, bank {}", bank.index())
            }
            HostEvent::Channels {
                bus,
                port,
                bank,
                mask,
                enable,
            } => {
                let verb = if enable { "enable" } else { "disable" };
                format!("{bus} master dp{port} {verb} ch {mask:#04x}, bank {}", bank.index())
            }
            HostEvent::Write {
                bus,
                target,
                addr,
                value,
            } => {
                let target = match target {
                    Target::Device(dev) => format!("dev{dev}"),
                    Target::Broadcast => "broadcast".to_string(),
                };
                format!("{bus} write {target} {addr:#06x} = {value:#04x}")
            }
            HostEvent::AsyncQueued { bus, addr } => format!("{bus} queued {addr:#06x}"),
            HostEvent::AsyncDropped { bus, addr } => format!("{bus} dropped {addr:#06x}"),
        }
    }
}

/// Plan SoundWire bandwidth for a described system.
#[derive(Parser, Debug)]
#[command(author, version, about = "Plan SoundWire bus allocations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every frame shape in the order the solver tries them.
    Catalog {
        /// Only list shapes with this many columns.
        #[arg(short, long)]
        col: Option<u32>,
    },
    /// Bring up streams from a topology and print each bus's layout.
    Plan {
        /// Path to the topology TOML file.
        #[arg(value_name = "TOPOLOGY")]
        topology: PathBuf,
        /// Streams to bring up, in order (defaults to every stream).
        #[arg(short, long = "stream", value_name = "NAME")]
        streams: Vec<String>,
        /// Streams to tear down again once everything is up.
        #[arg(short, long = "release", value_name = "NAME")]
        release: Vec<String>,
        /// How far to take the streams.
        #[arg(long, value_enum, default_value_t = Stage::Enabled)]
        until: Stage,
        /// Also print every controller operation.
        #[arg(long)]
        trace: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Stage {
    /// Reserve bandwidth without enabling channels.
    Prepared,
    /// Reserve bandwidth and enable channels.
    Enabled,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Catalog { col } => handle_catalog(col),
        Command::Plan {
            topology,
            streams,
            release,
            until,
            trace,
        } => handle_plan(&topology, &streams, &release, until, trace)?,
    }

    Ok(())
}

fn handle_catalog(col: Option<u32>) {
    let pairs: Vec<_> = frame::catalog()
        .iter()
        .copied()
        .filter(|pair| col.map_or(true, |col| pair.col == col))
        .collect();
    print!("{}", render::catalog(&pairs));
}

fn handle_plan(
    path: &Path,
    streams: &[String],
    release: &[String],
    until: Stage,
    trace: bool,
) -> Result<()> {
    let topology = Topology::load(path)?;
    let system = topology.build(SimHost::new())?;

    let bring_up: Vec<String> = if streams.is_empty() {
        system.streams.iter().map(|(name, _)| name.clone()).collect()
    } else {
        streams.to_vec()
    };
    for name in &bring_up {
        let tag = lookup(&system, name)?;
        bring_up_stream(&system.core, tag, until)
            .with_context(|| format!("failed to bring up stream {name:?}"))?;
        info!("{name} ({tag}) {until:?}");
    }
    for name in release {
        let tag = lookup(&system, name)?;
        tear_down_stream(&system.core, tag, until)
            .with_context(|| format!("failed to release stream {name:?}"))?;
        info!("{name} ({tag}) released");
    }

    print!("{}", plan_report(&system)?);
    if trace {
        print!("{}", render::events(&system.host.events()));
    }
    Ok(())
}

fn lookup(system: &System, name: &str) -> Result<StreamTag> {
    system
        .tag(name)
        .with_context(|| format!("topology has no stream named {name:?}"))
}

fn bring_up_stream(core: &SdwCore, tag: StreamTag, until: Stage) -> Result<()> {
    match until {
        Stage::Prepared => core.prepare_stream(tag)?,
        Stage::Enabled => core.prepare_and_enable(tag)?,
    }
    Ok(())
}

fn tear_down_stream(core: &SdwCore, tag: StreamTag, until: Stage) -> Result<()> {
    match until {
        Stage::Prepared => core.deprepare_stream(tag)?,
        Stage::Enabled => core.disable_and_deprepare(tag)?,
    }
    Ok(())
}

fn plan_report(system: &System) -> Result<String> {
    let mut out = String::new();
    for id in system.core.bus_ids() {
        let bus = system.core.bus(id)?;
        let state = bus.lock();
        out.push_str(&render::plan(
            id,
            state.params(),
            state.masters(),
            &system.streams,
        ));
    }
    Ok(out)
}
