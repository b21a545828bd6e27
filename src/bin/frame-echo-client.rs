//! Command-line client: sends each message as one frame and prints the reply.

use clap::Parser;
use frame_echo::FrameClient;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "frame-echo-client")]
#[command(version = "0.1.0")]
#[command(about = "Send framed messages to a frame-echo server", long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:9000", env = "FRAME_ECHO_ADDR")]
    addr: String,

    /// Maximum request frame payload in bytes
    #[arg(short = 'f', long, default_value_t = 1024 * 1024)]
    max_frame_size: usize,

    /// Messages to send, one frame each
    #[arg(required = true)]
    messages: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut client = match FrameClient::connect(args.addr.as_str(), args.max_frame_size).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("frame-echo-client: failed to connect to {}: {e}", args.addr);
            return ExitCode::FAILURE;
        }
    };

    for message in &args.messages {
        match client.request(message.as_bytes()).await {
            Ok(response) => println!("{}", String::from_utf8_lossy(&response)),
            Err(e) => {
                eprintln!("frame-echo-client: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    if let Err(e) = client.close().await {
        eprintln!("frame-echo-client: {e}");
    }
    ExitCode::SUCCESS
}
