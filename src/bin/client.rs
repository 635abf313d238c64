use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pixelboard::api::{ClientRequest, ServerMessage};
use pixelboard::transport::{read_frame, write_frame};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Node (or balancer) client address to connect to
    #[arg(long, default_value = "127.0.0.1:7000")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Paint a single pixel
    Put {
        #[arg(short, long)]
        x: u32,

        #[arg(short, long)]
        y: u32,

        /// Color as 0xRRGGBB, #RRGGBB, or decimal
        #[arg(short, long, value_parser = parse_color)]
        color: u32,
    },
    /// Fetch the whole canvas, optionally rendering it to a PNG file
    Pixels {
        /// Write the canvas to this PNG file instead of printing a summary
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Query node liveness
    Status,
    /// Stream live pixel updates
    Watch,
}

fn parse_color(raw: &str) -> Result<u32, String> {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix('#')) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("bad hex color {:?}: {}", raw, e))
    } else {
        raw.parse()
            .map_err(|e| format!("bad color {:?}: {}", raw, e))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut stream = TcpStream::connect(&cli.addr)
        .await
        .with_context(|| format!("connecting to {}", cli.addr))?;

    match cli.command {
        Commands::Put { x, y, color } => {
            write_frame(&mut stream, &ClientRequest::SubmitPixel { x, y, color }).await?;
            match read_frame(&mut stream).await? {
                ServerMessage::SubmitResult { success: true } => {
                    println!("painted ({}, {}) = #{:06X}", x, y, color);
                }
                ServerMessage::SubmitResult { success: false } => {
                    bail!("the cluster rejected the write (no leader, or out of bounds)");
                }
                other => bail!("unexpected reply: {:?}", other),
            }
        }
        Commands::Pixels { out } => {
            write_frame(&mut stream, &ClientRequest::GetPixels).await?;
            let ServerMessage::Pixels { pixels } = read_frame(&mut stream).await? else {
                bail!("unexpected reply to get_pixels");
            };
            let side = (pixels.len() as f64).sqrt() as u32;
            if (side * side) as usize != pixels.len() {
                bail!("server returned a non-square canvas of {} pixels", pixels.len());
            }
            match out {
                Some(path) => {
                    save_png(&pixels, side, &path)?;
                    println!("wrote {}x{} canvas to {}", side, side, path.display());
                }
                None => {
                    let painted = pixels.iter().filter(|&&c| c != 0).count();
                    println!("{}x{} canvas, {} painted pixels", side, side, painted);
                }
            }
        }
        Commands::Status => {
            write_frame(&mut stream, &ClientRequest::Status).await?;
            let ServerMessage::Status { status } = read_frame(&mut stream).await? else {
                bail!("unexpected reply to status");
            };
            println!("status: {}", status);
        }
        Commands::Watch => watch(stream).await?,
    }

    Ok(())
}

fn save_png(pixels: &[u32], side: u32, path: &PathBuf) -> Result<()> {
    let mut img = image::RgbImage::new(side, side);
    for (i, &color) in pixels.iter().enumerate() {
        let x = i as u32 % side;
        let y = i as u32 / side;
        let rgb = [
            ((color >> 16) & 0xFF) as u8,
            ((color >> 8) & 0xFF) as u8,
            (color & 0xFF) as u8,
        ];
        img.put_pixel(x, y, image::Rgb(rgb));
    }
    img.save(path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Subscribe and print the update stream until the connection drops. A ping
/// goes out every 20 s to keep intermediaries from reaping the idle link.
async fn watch(stream: TcpStream) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    write_frame(&mut writer, &ClientRequest::Subscribe).await?;

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(20)).await;
            if write_frame(&mut writer, &ClientRequest::Ping).await.is_err() {
                let _ = writer.shutdown().await;
                return;
            }
        }
    });

    loop {
        match read_frame(&mut reader).await? {
            ServerMessage::Connected { node } => {
                println!("connected to {} ({})", node.id, node.role);
            }
            ServerMessage::Pixel { content } => {
                println!("({}, {}) = #{:06X}", content.x, content.y, content.color);
            }
            ServerMessage::Pong { .. } => {}
            other => println!("unexpected message: {:?}", other),
        }
    }
}
