//! voice-engine-control - CLI utility for the voice engine server
//!
//! Lists engines and voices, registers voices, and fetches synthesized
//! audio over the server's local endpoint.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use voice_engine_server::client::Client;
use voice_engine_server::config_loader::Settings;

/// CLI utility for the voice engine server
#[derive(Parser)]
#[command(name = "voice-engine-control")]
#[command(author = "StarTuz")]
#[command(version)]
#[command(about = "Control utility for the voice engine server", long_about = None)]
struct Cli {
    /// Settings file used to locate the server endpoint
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available engines
    Engines,

    /// List the voices of an engine
    Voices {
        /// Engine name as configured on the server
        engine: String,
    },

    /// Register voices with the system speech subsystem
    Register {
        /// Engine name
        engine: String,
        /// Voice ids or display names
        #[arg(required = true)]
        voices: Vec<String>,
    },

    /// Synthesize text and save the audio
    Speak {
        /// Engine name
        engine: String,
        /// Text to speak
        text: String,
        /// Voice to use (optional)
        #[arg(short, long)]
        voice: Option<String>,
        /// Output file
        #[arg(short, long, default_value = "speech.wav")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    let client = Client::from_settings(&settings);

    match cli.command {
        Commands::Engines => {
            let engines = client.list_engines().await?;
            if engines.is_empty() {
                println!("No engines available");
            } else {
                println!("Available Engines");
                println!("─────────────────");
                for engine in engines {
                    println!("  {}", engine);
                }
            }
        }

        Commands::Voices { engine } => {
            let voices = client.list_voices(&engine).await?;
            println!("Voices for {}", engine);
            println!("──────────{}", "─".repeat(engine.chars().count()));
            for voice in voices {
                match voice.locale {
                    Some(locale) => println!("  {} ({}) [{}]", voice.name, voice.id, locale),
                    None => println!("  {} ({})", voice.name, voice.id),
                }
            }
        }

        Commands::Register { engine, voices } => {
            let mut failed = 0;
            for voice in voices {
                match client.set_voice(&engine, &voice).await {
                    Ok(token) => println!("✓ Registered '{}' as {}", voice, token),
                    Err(e) => {
                        failed += 1;
                        eprintln!("✗ Failed to register '{}': {}", voice, e);
                    }
                }
            }
            if failed > 0 {
                return Err(format!("{} voice(s) failed to register", failed).into());
            }
        }

        Commands::Speak {
            engine,
            text,
            voice,
            output,
        } => {
            let audio = client.speak(&engine, voice.as_deref(), &text).await?;
            std::fs::write(&output, &audio)?;
            println!("Wrote {} bytes of audio to {}", audio.len(), output.display());
        }
    }

    Ok(())
}
