#![forbid(unsafe_code)]

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tessera_graph::{CsrGraph, LocalGraph};
use tessera_ingress::{IngressCoordinator, LocalCluster, PartitionedGraph, RandomHash, Transport};
use tessera_types::Gvid;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

type BenchResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser, Debug)]
#[command(
    name = "ingest",
    about = "Partition a synthetic random graph across an in-process worker cluster"
)]
struct Args {
    /// Number of workers in the in-process cluster.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Vertex id range of the synthetic graph.
    #[arg(long, default_value_t = 10_000)]
    vertices: u64,

    /// Edges to ingest across the cluster.
    #[arg(long, default_value_t = 100_000)]
    edges: usize,

    /// Bytes of synthetic payload attached to each edge.
    #[arg(long, default_value_t = 0)]
    payload_bytes: usize,

    /// RNG seed for a reproducible graph.
    #[arg(long, default_value_t = 0x5eed)]
    seed: u64,

    /// Emit the report as JSON instead of a table.
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Log filter, e.g. "info" or "tessera_ingress=debug".
    #[arg(long, default_value = "warn")]
    log: String,
}

#[derive(Debug, Serialize)]
struct WorkerReport {
    worker: u16,
    local_edges: usize,
    local_vertices: usize,
    owned_vertices: usize,
}

#[derive(Debug, Serialize)]
struct Report {
    workers: usize,
    edges: u64,
    vertices: u64,
    replicas: u64,
    replication_factor: f64,
    elapsed_ms: u128,
    per_worker: Vec<WorkerReport>,
}

fn main() -> BenchResult<()> {
    let args = Args::parse();
    fmt()
        .with_env_filter(EnvFilter::try_new(args.log.as_str())?)
        .with_target(true)
        .try_init()
        .map_err(|err| format!("logging init failed: {err}"))?;

    let report = run(&args)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_table(&report);
    }
    Ok(())
}

fn run(args: &Args) -> BenchResult<Report> {
    let nworkers = args.workers.max(1);
    info!(nworkers, edges = args.edges, "ingest.start");

    let started = Instant::now();
    let endpoints = LocalCluster::endpoints(nworkers);
    let mut parts: Vec<PartitionedGraph<CsrGraph>> = thread::scope(|scope| {
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|ep| {
                scope.spawn(move || {
                    let pid = ep.pid();
                    let transport: Arc<dyn Transport> = Arc::new(ep);
                    let coord =
                        IngressCoordinator::new(transport, CsrGraph::new(), RandomHash)?;
                    // Each worker generates and submits its own shard.
                    let mut rng =
                        ChaCha8Rng::seed_from_u64(args.seed.wrapping_add(pid.0 as u64));
                    let shard = args.edges / nworkers
                        + usize::from(pid.index() < args.edges % nworkers);
                    for _ in 0..shard {
                        let src = rng.gen_range(0..args.vertices);
                        let dst = rng.gen_range(0..args.vertices);
                        let payload = vec![0u8; args.payload_bytes];
                        coord.add_edge(Gvid(src), Gvid(dst), payload)?;
                    }
                    coord.finalize()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker thread panicked"))
            .collect::<tessera_types::Result<Vec<_>>>()
    })?;
    parts.sort_by_key(|p| p.pid().0);
    let elapsed = started.elapsed();

    let per_worker = parts
        .iter()
        .map(|p| WorkerReport {
            worker: p.pid().0,
            local_edges: p.graph().num_edges(),
            local_vertices: p.num_local_vertices(),
            owned_vertices: p.num_local_own_vertices(),
        })
        .collect();

    Ok(Report {
        workers: nworkers,
        edges: parts[0].nedges(),
        vertices: parts[0].nverts(),
        replicas: parts[0].nreplicas(),
        replication_factor: parts[0].replication_factor(),
        elapsed_ms: elapsed.as_millis(),
        per_worker,
    })
}

fn print_table(report: &Report) {
    println!(
        "{} workers | {} edges | {} vertices | {} replicas | replication {:.3} | {} ms",
        report.workers,
        report.edges,
        report.vertices,
        report.replicas,
        report.replication_factor,
        report.elapsed_ms
    );
    println!("{:>6} {:>12} {:>15} {:>14}", "worker", "local_edges", "local_vertices", "owned");
    for row in &report.per_worker {
        println!(
            "{:>6} {:>12} {:>15} {:>14}",
            row.worker, row.local_edges, row.local_vertices, row.owned_vertices
        );
    }
}
