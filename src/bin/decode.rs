use clap::Parser;
use hound::WavReader;
use std::path::PathBuf;
use tracing::{info, warn};
use xd_stt::config::Config;
use xd_stt::Decoder;

#[derive(Parser, Debug)]
pub struct Args {
    /// Audio to decode: 16-bit mono PCM WAV
    input: PathBuf,
    /// Directory containing the acoustic model files
    #[clap(long, default_value = "./models/en-us")]
    hmm: PathBuf,
    /// Main pronunciation dictionary
    #[clap(long)]
    dict: Option<PathBuf>,
    /// Filler (noise) dictionary
    #[clap(long)]
    fdict: Option<PathBuf>,
    /// FSG grammar file
    #[clap(long)]
    fsg: Option<PathBuf>,
    /// JSGF grammar file
    #[clap(long)]
    jsgf: Option<PathBuf>,
    /// Fully qualified top rule for the JSGF grammar
    #[clap(long)]
    toprule: Option<String>,
    /// Keyphrase to spot instead of a grammar
    #[clap(long)]
    keyphrase: Option<String>,
    /// Text to force-align against the audio
    #[clap(long)]
    align: Option<String>,
    /// Print the phone and state segmentation as well
    #[clap(long)]
    phones: bool,
}

fn main() -> anyhow::Result<()> {
    xd_stt::setup_logging();
    let args = Args::parse();

    let mut reader = WavReader::open(&args.input)?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.bits_per_sample != 16 {
        anyhow::bail!(
            "expected 16-bit mono audio, got {} channels at {} bits",
            spec.channels,
            spec.bits_per_sample
        );
    }
    let samples: Vec<i16> = reader.samples::<i16>().collect::<Result<_, _>>()?;
    info!(
        "Read {} samples at {} Hz from {}",
        samples.len(),
        spec.sample_rate,
        args.input.display()
    );

    let mut config = Config::default();
    config.hmm = Some(args.hmm);
    config.dict = args.dict;
    config.fdict = args.fdict;
    config.fsg = args.fsg;
    config.jsgf = args.jsgf;
    config.toprule = args.toprule;
    config.keyphrase = args.keyphrase;
    config.align = args.align;
    config.samprate = spec.sample_rate;

    let mut decoder = Decoder::init(config)?;
    decoder.start_utt()?;
    // Chunked feed, the way a live audio source would deliver it.
    for chunk in samples.chunks(2048) {
        decoder.process_raw(chunk, false, false)?;
    }
    decoder.end_utt()?;

    let (hyp, score) = decoder.get_hyp();
    if hyp.is_empty() {
        warn!("no hypothesis survived the beams");
    }
    println!("{hyp} ({score}, {})", decoder.get_prob());
    for seg in decoder.seg_iter() {
        println!("{} {} {}", seg.word, seg.sf, seg.ef);
    }

    if args.phones {
        let al = decoder.alignment()?;
        for word in al.words() {
            for phone in word.children() {
                let (sf, dur, score) = phone.seg();
                println!("{} {} {} {}", phone.name(), sf, sf + dur - 1, score);
                for state in phone.children() {
                    let (ssf, sdur, sscore) = state.seg();
                    println!("  {} {} {} {}", state.name(), ssf, ssf + sdur - 1, sscore);
                }
            }
        }
    }
    Ok(())
}
