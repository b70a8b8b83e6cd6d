#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use signaling_server::config::Config;

fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    simple_logger::init_with_level(config.log.level.as_level())?;

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.max_threads.max(1))
        .enable_all()
        .build()?
        .block_on(signaling_server::start_server(config))
}
