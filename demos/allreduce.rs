use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Timelike;
use env_logger::fmt::Color;
use std::io::Write;
use structopt::StructOpt;

use ccrt::coll::{CollType, DataType, ReduceOp};
use ccrt::comm::{Communicator, CommunicatorId};
use ccrt::config::Config;
use ccrt::context::Context;
use ccrt::driver::fake::FakeDriver;
use ccrt::driver::{ContextId, DeviceId};
use ccrt::engine::Worker;
use ccrt::sched::build::OpDesc;
use ccrt::sched::BufPtr;
use ccrt::selection::SelectorParam;
use ccrt::transport::local::local_fabric;

#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "ccrt all-reduce demo")]
struct Opts {
    /// Number of in-process ranks
    #[structopt(short, long, default_value = "4")]
    ranks: usize,
    /// Elements per rank
    #[structopt(short, long, default_value = "1024")]
    count: usize,
    /// Optional runtime config
    #[structopt(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    better_panic::install();
    let opts = Opts::from_args();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let time = chrono::Local::now();
            let style = buf
                .style()
                .set_color(Color::Black)
                .set_intense(true)
                .clone();
            let time = format!(
                "{:02}:{:02}:{:02}.{:03}",
                time.hour() % 24,
                time.minute(),
                time.second(),
                time.timestamp_subsec_millis()
            );
            writeln!(
                buf,
                "{}{} {} {}{} {}",
                style.value("["),
                time,
                buf.default_styled_level(record.level()),
                record.module_path().unwrap_or(""),
                style.value("]"),
                record.args()
            )
        })
        .init();

    let config = match &opts.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };
    let transport = config.transport.kind;
    let context = Arc::new(Context::new(config, Arc::new(FakeDriver::new()))?);
    log::info!(
        "all-reduce over {} ranks, {} floats each",
        opts.ranks,
        opts.count
    );

    let mut joins = Vec::new();
    for (rank, endpoint) in local_fabric(opts.ranks).into_iter().enumerate() {
        let context = Arc::clone(&context);
        let (ranks, count) = (opts.ranks, opts.count);
        joins.push(std::thread::spawn(move || -> Result<()> {
            let comm = Communicator::new(CommunicatorId(0), rank, ranks);
            let param = SelectorParam::host(
                CollType::Allreduce,
                count,
                DataType::Float32,
                Some(ReduceOp::Sum),
                &comm,
                transport,
            );
            let algo = context.select(&param)?;
            log::info!("rank {} selected '{}'", rank, algo.name());

            let mut send: Vec<f32> = (0..count)
                .map(|j| (rank + 1) as f32 * (j % 7 + 1) as f32)
                .collect();
            let mut recv = vec![0f32; count];
            let desc = OpDesc {
                send: BufPtr::new(send.as_mut_ptr() as *mut u8, count * 4),
                recv: BufPtr::new(recv.as_mut_ptr() as *mut u8, count * 4),
                count,
                root: 0,
                counts: None,
            };
            let sched = context.prepare(
                &param,
                algo,
                Box::new(endpoint),
                &desc,
                0,
                DeviceId(0),
                ContextId(0),
                false,
            )?;
            let mut worker = Worker::new(0, Arc::clone(&context.sched_cache));
            let ticket = worker.submit(sched)?;
            worker.wait(ticket)?;

            let rank_sum = (ranks * (ranks + 1) / 2) as f32;
            for (j, &v) in recv.iter().enumerate() {
                let expected = rank_sum * (j % 7 + 1) as f32;
                assert_eq!(v, expected, "rank {} element {}", rank, j);
            }
            log::info!("rank {} verified {} elements", rank, count);
            Ok(())
        }));
    }
    for join in joins {
        join.join().expect("rank thread panicked")?;
    }
    log::info!("all ranks agree");
    Ok(())
}
