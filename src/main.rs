use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use talkback::agent::{OpenAiResponder, Responder, VoiceAgent};
use talkback::voice::{
    AudioBuffer, AudioCapture, AudioOutput, CpalOutput, LoggingObserver, OpenAiSpeech,
    PlaybackSequencer, Recognizer, RecognizerGuard, SAMPLE_RATE, SegmentSynthesizer,
    SimulatedOutput, SpeechBackend, SpeechObserver, SpeechPipeline, SynthesisCache,
    SynthesisPolicy, WhisperRecognizer, rms,
};
use talkback::Config;

/// Talkback - streaming speech front-end for voice assistants
#[derive(Parser)]
#[command(name = "talkback", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/talkback/config.toml)
    #[arg(short, long, env = "TALKBACK_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the conversational loop (default)
    Run,
    /// Speak text through the streaming pipeline
    Say {
        /// Text to speak; read from stdin when omitted
        text: Vec<String>,
        /// Simulate the output device instead of opening speakers
        #[arg(long)]
        no_audio: bool,
        /// Disable voice command listening
        #[arg(long)]
        no_commands: bool,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,talkback=info",
        1 => "info,talkback=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_agent(config).await,
        Command::Say {
            text,
            no_audio,
            no_commands,
        } => say(config, text, no_audio, no_commands).await,
        Command::TestMic { duration } => test_mic(duration).await,
        Command::TestSpeaker => test_speaker().await,
        Command::TestTts { text } => test_tts(config, &text).await,
    }
}

/// Open the speakers, or a simulated device when `simulate` is set
fn open_output(simulate: bool) -> anyhow::Result<Arc<dyn AudioOutput>> {
    if simulate {
        return Ok(Arc::new(SimulatedOutput::new()));
    }
    Ok(Arc::new(CpalOutput::new()?))
}

fn build_synthesizer(
    config: &Config,
    observer: &Arc<dyn SpeechObserver>,
) -> anyhow::Result<SegmentSynthesizer> {
    let backend: Arc<dyn SpeechBackend> =
        Arc::new(OpenAiSpeech::from_config(&config.synthesis, &config.api_keys)?);
    Ok(SegmentSynthesizer::new(
        backend,
        Arc::new(SynthesisCache::new(config.synthesis.cache_capacity)),
        SynthesisPolicy::from(&config.synthesis),
        Arc::clone(observer),
    ))
}

fn build_recognizer(config: &Config) -> anyhow::Result<RecognizerGuard> {
    let recognizer: Arc<dyn Recognizer> = Arc::new(WhisperRecognizer::from_config(
        &config.recognition,
        &config.api_keys,
        config.commands.listen_window,
    )?);
    Ok(RecognizerGuard::new(recognizer, config.commands.min_listen))
}

async fn run_agent(config: Config) -> anyhow::Result<()> {
    let observer: Arc<dyn SpeechObserver> = Arc::new(LoggingObserver);
    let synthesizer = build_synthesizer(&config, &observer)?;
    let sequencer = PlaybackSequencer::with_gate_factor(
        open_output(false)?,
        config.speech.initial_rate,
        config.speech.near_completion_factor,
    );
    let recognizer = build_recognizer(&config)?;

    let pipeline = SpeechPipeline::with_commands(
        synthesizer,
        sequencer,
        config.speech.clone(),
        Arc::clone(&observer),
        recognizer.clone(),
        &config.commands,
    );
    let responder: Arc<dyn Responder> =
        Arc::new(OpenAiResponder::from_config(&config.llm, &config.api_keys)?);
    let agent = VoiceAgent::new(recognizer, responder, pipeline, observer);

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            shutdown.cancel();
        }
    });

    agent.run(token).await?;
    Ok(())
}

async fn say(
    config: Config,
    text: Vec<String>,
    no_audio: bool,
    no_commands: bool,
) -> anyhow::Result<()> {
    let text = if text.is_empty() {
        let mut input = String::new();
        std::io::stdin().read_to_string(&mut input)?;
        input
    } else {
        text.join(" ")
    };

    let observer: Arc<dyn SpeechObserver> = Arc::new(LoggingObserver);
    let synthesizer = build_synthesizer(&config, &observer)?;
    let sequencer = PlaybackSequencer::with_gate_factor(
        open_output(no_audio)?,
        config.speech.initial_rate,
        config.speech.near_completion_factor,
    );

    // Listening needs a microphone; a simulated run never has one
    let pipeline = if no_audio || no_commands || !config.commands.enabled {
        SpeechPipeline::new(synthesizer, sequencer, config.speech.clone(), observer)
    } else {
        SpeechPipeline::with_commands(
            synthesizer,
            sequencer,
            config.speech.clone(),
            observer,
            build_recognizer(&config)?,
            &config.commands,
        )
    };

    let stopper = pipeline.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.stop();
        }
    });

    let report = pipeline.speak(&text).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let levels = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<(f32, f32)>> {
        let mut capture = AudioCapture::new()?;
        capture.start()?;

        let mut levels = Vec::new();
        for _ in 0..duration {
            std::thread::sleep(Duration::from_secs(1));
            let audio = capture.take_buffer()?;
            let peak = audio.samples().iter().map(|s| s.abs()).fold(0.0f32, f32::max);
            levels.push((rms(audio.samples()), peak));
        }

        capture.stop();
        Ok(levels)
    })
    .await??;

    println!("Sample rate: {SAMPLE_RATE} Hz");
    println!("---");
    for (i, (energy, peak)) in levels.iter().enumerate() {
        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);
        println!("[{:2}s] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]", i + 1);
    }

    println!("\n---");
    println!("If RMS moved above 0, your mic is working!");
    println!("If it stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let frequency = 440.0_f32;
    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..SAMPLE_RATE * 2)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    let sequencer = PlaybackSequencer::new(open_output(false)?, 1.0);
    println!("Playing {} samples at {SAMPLE_RATE} Hz...", samples.len());
    let end = sequencer.play(0, AudioBuffer::new(samples))?.finished().await;
    tracing::debug!(?end, "tone finished");

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Test TTS output
async fn test_tts(config: Config, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let backend = OpenAiSpeech::from_config(&config.synthesis, &config.api_keys)?;

    println!("Synthesizing speech...");
    let mp3_data = backend.synthesize_mp3(text).await?;
    println!("Got {} bytes of audio data", mp3_data.len());

    let audio = AudioBuffer::from_mp3(&mp3_data)?;
    println!("Decoded {:.2}s of audio", audio.duration().as_secs_f64());

    println!("Playing audio...");
    let sequencer = PlaybackSequencer::new(open_output(false)?, 1.0);
    sequencer.play(0, audio)?.finished().await;

    println!("Done!");
    Ok(())
}
