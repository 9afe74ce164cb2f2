//! 学習済みモデルで分かち書きを実行するユーティリティ
//!
//! 標準入力から1行=1文として読み（または`--read-all`で全体を1テキストと
//! して読み）、トークンを空白区切りで1行ずつ出力します。`--detok`は
//! 逆方向で、losslessトークン列から元のテキストを復元します。

use std::error::Error;
use std::io::{BufWriter, IsTerminal, Read, Write};
use std::path::PathBuf;

use clap::Parser;

use momiji::decoder::sample::XorShift32;
use momiji::lossless;
use momiji::model::Model;
use momiji::utf8;
use momiji::Tokenizer;

/// コマンドライン引数
#[derive(Parser, Debug)]
#[clap(name = "tokenize", about = "Segments text with a momiji model")]
struct Args {
    /// Model file produced by the trainer.
    #[clap(short = 'm', long)]
    model: PathBuf,

    /// Skip lines longer than this many bytes.
    #[clap(long, default_value = "16384")]
    max_line_bytes: usize,

    /// Do not normalize input to canonical UTF-8.
    #[clap(long)]
    no_normalize: bool,

    /// Fallback character for invalid UTF-8 input.
    #[clap(long, default_value = "?")]
    fallback_char: String,

    /// Lossless whitespace: -1=auto (from model), 0=off, 1=on.
    #[clap(long, default_value = "-1", allow_hyphen_values = true)]
    lossless_ws: i32,

    /// Read all of stdin as one text (newlines included).
    #[clap(long)]
    read_all: bool,

    /// Detokenize mode (token stream -> original text).
    #[clap(long)]
    detok: bool,

    /// FFBS sampling (one sample per line).
    #[clap(long)]
    sample: bool,

    /// Sampling temperature.
    #[clap(long, default_value = "1.0")]
    temperature: f64,

    /// RNG seed for sampling.
    #[clap(long, default_value = "1")]
    seed: u32,

    /// Output the N best segmentations, one per line.
    #[clap(long)]
    nbest: Option<usize>,

    /// Sample one segmentation uniformly from the top N.
    #[clap(long)]
    sample_nbest: Option<usize>,

    /// Text to tokenize. Reads stdin lines when not given.
    text: Vec<String>,
}

enum DecodeMode {
    Best,
    SampleFfbs,
    NbestList(usize),
    SampleNbest(usize),
}

fn read_stdin_lines(max_line_bytes: usize) -> Result<Vec<String>, std::io::Error> {
    let mut input = String::new();
    std::io::stdin().lock().read_to_string(&mut input)?;
    Ok(input
        .lines()
        .filter(|l| max_line_bytes == 0 || l.len() <= max_line_bytes)
        .map(|l| l.trim_end_matches('\r').to_string())
        .collect())
}

fn detokenize(args: &Args) -> Result<(), Box<dyn Error>> {
    let out = std::io::stdout();
    let mut out = BufWriter::new(out.lock());

    let mut joined = vec![];
    let mut decoded = vec![];

    if args.read_all {
        let mut input = String::new();
        std::io::stdin().lock().read_to_string(&mut input)?;
        joined.extend(input.bytes().filter(|&b| b != b' ' && b != b'\n'));
        lossless::decode(&joined, &mut decoded);
        out.write_all(&decoded)?;
        if decoded.last() != Some(&b'\n') {
            out.write_all(b"\n")?;
        }
    } else {
        for line in read_stdin_lines(args.max_line_bytes)? {
            joined.clear();
            joined.extend(line.bytes().filter(|&b| b != b' '));
            lossless::decode(&joined, &mut decoded);
            out.write_all(&decoded)?;
            if decoded.last() != Some(&b'\n') {
                out.write_all(b"\n")?;
            }
        }
    }
    out.flush()?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    if args.detok {
        return detokenize(&args);
    }

    let mode = if let Some(n) = args.nbest {
        DecodeMode::NbestList(n.clamp(1, 64))
    } else if let Some(n) = args.sample_nbest {
        DecodeMode::SampleNbest(n.clamp(1, 64))
    } else if args.sample {
        DecodeMode::SampleFfbs
    } else {
        DecodeMode::Best
    };

    let fallback_cp = args
        .fallback_char
        .chars()
        .next()
        .map_or(u32::from(b'?'), u32::from);

    eprintln!("Loading the model...");
    let model = Model::from_path(&args.model)?;
    let lossless_ws = match args.lossless_ws {
        -1 => model.lossless_ws(),
        0 => false,
        _ => true,
    };
    let tokenizer = Tokenizer::new(model);
    let mut worker = tokenizer.new_worker();
    let mut rng = XorShift32::new(args.seed);

    eprintln!("Ready to tokenize");

    // 入力の収集: 引数 > read-all > 行単位のstdin
    let inputs: Vec<String> = if !args.text.is_empty() {
        vec![args.text.join(" ")]
    } else if args.read_all {
        let mut input = String::new();
        std::io::stdin().lock().read_to_string(&mut input)?;
        vec![input]
    } else {
        read_stdin_lines(args.max_line_bytes)?
    };
    // read-allモードでは行構造もlossless対象に含める
    let include_newlines = args.read_all;

    let is_tty = std::io::stdout().is_terminal();
    let out = std::io::stdout();
    let mut out = BufWriter::new(out.lock());

    let mut prepared = vec![];
    let mut normalized = vec![];

    for line in &inputs {
        let mut bytes: &[u8] = line.as_bytes();
        if !args.no_normalize {
            utf8::normalize(bytes, fallback_cp, &mut normalized);
            bytes = &normalized;
        }
        if lossless_ws {
            lossless::encode(bytes, include_newlines, &mut prepared);
        } else {
            prepared.clear();
            prepared.extend_from_slice(bytes);
        }

        match mode {
            DecodeMode::Best => {
                worker.tokenize(&prepared)?;
                write_tokens(&mut out, &prepared, worker.boundaries_byte())?;
            }
            DecodeMode::SampleFfbs => {
                worker.tokenize_sample(&prepared, args.temperature, &mut rng)?;
                write_tokens(&mut out, &prepared, worker.boundaries_byte())?;
            }
            DecodeMode::NbestList(n) => {
                worker.tokenize_nbest(&prepared, n)?;
                for i in 0..worker.num_nbest_paths() {
                    let b_cp = worker.nbest_boundaries_cp(i).expect("index in range");
                    write_tokens_cp(&mut out, &prepared, worker.offsets(), b_cp)?;
                }
            }
            DecodeMode::SampleNbest(n) => {
                worker.tokenize_nbest(&prepared, n)?;
                let found = worker.num_nbest_paths();
                let pick = (rng.next_u32() as usize) % found.max(1);
                let b_cp = worker.nbest_boundaries_cp(pick).expect("index in range");
                write_tokens_cp(&mut out, &prepared, worker.offsets(), b_cp)?;
            }
        }
        if is_tty {
            out.flush()?;
        }
    }

    out.flush()?;
    Ok(())
}

/// バイト境界でトークンを空白区切り出力します。
fn write_tokens<W>(out: &mut W, text: &[u8], boundaries: &[u16]) -> std::io::Result<()>
where
    W: Write,
{
    for (i, w) in boundaries.windows(2).enumerate() {
        if i != 0 {
            out.write_all(b" ")?;
        }
        out.write_all(&text[usize::from(w[0])..usize::from(w[1])])?;
    }
    out.write_all(b"\n")
}

/// コードポイント境界をバイトに変換してトークンを出力します。
fn write_tokens_cp<W>(
    out: &mut W,
    text: &[u8],
    offsets: &[u16],
    b_cp: &[u16],
) -> std::io::Result<()>
where
    W: Write,
{
    for (i, w) in b_cp.windows(2).enumerate() {
        if i != 0 {
            out.write_all(b" ")?;
        }
        let s = usize::from(offsets[usize::from(w[0])]);
        let t = usize::from(offsets[usize::from(w[1])]);
        out.write_all(&text[s..t])?;
    }
    out.write_all(b"\n")
}
