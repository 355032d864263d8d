#[macro_use]
extern crate amplify;

use std::sync::Arc;

use clap::Parser;
use netloop::{App, AppError, Connection};

pub const DEFAULT_PORT: u16 = 6379;

/// Echo server over the netloop reactor.
///
/// Accepted connections echo every received byte back to the peer, with
/// response batching enabled so pipelined requests flush as one vectored
/// write.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Port to listen on (loopback only).
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Number of worker event loops.
    #[arg(default_value_t = 1)]
    pub workers: usize,
}

#[derive(Debug, Display, Error, From)]
#[display(inner)]
pub enum Error {
    #[from]
    App(AppError),
}

fn main() -> Result<(), Error> {
    env_logger::init();
    let args = Args::parse();

    let app = App::new(args.workers)?;
    let addr = app.listen(
        netloop::addr::LOOPBACK,
        args.port,
        Arc::new(|conn: &mut Connection| {
            conn.set_batch_send(true);
            conn.set_on_message(|conn, data| {
                let len = data.len();
                conn.send(data);
                len
            });
            conn.set_on_disconnect(|conn| {
                log::info!("Disconnected {}", conn.peer_addr());
            });
        }),
    )?;

    log::info!("Listening on {addr} ...");
    app.run();
    Ok(())
}
