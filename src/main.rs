use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use secrecy::SecretString;
use shardseal::{
    AeadAlg, CipherMode, CodecOptions, DEFAULT_CHUNK_SIZE, DEFAULT_DATA_PIECES,
    DEFAULT_PARITY_PIECES, DEFAULT_PIECE_SIZE, ResistMode, StreamHeader, StreamReader, StreamWriter,
};
use tempfile::NamedTempFile;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "shardseal",
    version,
    about = "Encode files into damage-resistant, optionally encrypted streams"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encode a file
    Encode(EncodeArgs),
    /// Decode a file produced by `encode`
    Decode(DecodeArgs),
}

#[derive(Args, Debug)]
struct EncodeArgs {
    /// Input file
    #[arg(short = 'i', long = "in")]
    input: PathBuf,

    /// Output file
    #[arg(short = 'o', long = "out")]
    output: PathBuf,

    /// Erasure resistance
    #[arg(long, value_enum, default_value_t = ResistChoice::Rs)]
    resist: ResistChoice,

    /// Cipher layer
    #[arg(long, value_enum, default_value_t = CipherChoice::Aead)]
    cipher: CipherChoice,

    /// Data piece size in bytes
    #[arg(long = "dps", default_value_t = DEFAULT_PIECE_SIZE)]
    piece_size: usize,

    /// Data pieces per group
    #[arg(long = "dpc", default_value_t = DEFAULT_DATA_PIECES)]
    data_pieces: usize,

    /// Parity pieces per group
    #[arg(long = "ppc", default_value_t = DEFAULT_PARITY_PIECES)]
    parity_pieces: usize,

    /// Plaintext chunk size in bytes (cipher aead, or no resistance)
    #[arg(long = "ccs", default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    #[arg(short = 'a', long, value_enum, default_value_t = AlgChoice::Xchacha)]
    alg: AlgChoice,

    /// Read password from file instead of interactive prompt
    #[arg(short = 'p', long = "password-file")]
    password_file: Option<PathBuf>,

    /// Overwrite output if it exists
    #[arg(short = 'f', long = "force")]
    force: bool,
}

#[derive(Args, Debug)]
struct DecodeArgs {
    /// Input file (encoded)
    #[arg(short = 'i', long = "in")]
    input: PathBuf,

    /// Output file
    #[arg(short = 'o', long = "out")]
    output: PathBuf,

    /// Optional path to a file containing the password (trailing newline will be trimmed).
    /// Only read when the stream is encrypted.
    #[arg(short = 'p', long = "password-file")]
    password_file: Option<PathBuf>,

    /// Overwrite the output file if it already exists.
    #[arg(short = 'f', long = "force")]
    force: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ResistChoice {
    Rs,
    #[value(name = "none")]
    Off,
}

impl From<ResistChoice> for ResistMode {
    fn from(v: ResistChoice) -> Self {
        match v {
            ResistChoice::Rs => ResistMode::ReedSolomon,
            ResistChoice::Off => ResistMode::None,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum CipherChoice {
    Aead,
    #[value(name = "none")]
    Off,
}

impl From<CipherChoice> for CipherMode {
    fn from(v: CipherChoice) -> Self {
        match v {
            CipherChoice::Aead => CipherMode::Aead,
            CipherChoice::Off => CipherMode::None,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum AlgChoice {
    Xchacha,
    Aes,
}

impl From<AlgChoice> for AeadAlg {
    fn from(v: AlgChoice) -> Self {
        match v {
            AlgChoice::Xchacha => AeadAlg::XChaCha20Poly1305,
            AlgChoice::Aes => AeadAlg::Aes256GcmSiv,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Encode(a) => cmd_encode(a),
        Command::Decode(a) => cmd_decode(a),
    }
}

fn read_password(password_file: &Option<PathBuf>, prompt: &str) -> Result<SecretString> {
    if let Some(path) = password_file {
        let mut s = String::new();
        fs::File::open(path)
            .with_context(|| format!("cannot open password file {}", path.display()))?
            .read_to_string(&mut s)?;

        let secret =
            SecretString::new(s.trim_end_matches(&['\r', '\n'][..]).to_owned().into_boxed_str());

        use zeroize::Zeroize;
        s.zeroize();
        Ok(secret)
    } else {
        let pw = rpassword::prompt_password(prompt)?;
        Ok(SecretString::new(pw.into_boxed_str()))
    }
}

fn cmd_encode(a: EncodeArgs) -> Result<()> {
    let cipher = CipherMode::from(a.cipher);
    let mut opts = CodecOptions::default()
        .with_pieces(a.piece_size, a.data_pieces, a.parity_pieces)
        .with_chunk_size(a.chunk_size);
    opts.alg = AeadAlg::from(a.alg);
    if cipher == CipherMode::Aead {
        opts = opts.with_password(read_password(&a.password_file, "Password: ")?);
    }

    check_overwrite(&a.output, a.force)?;
    let input = fs::File::open(&a.input)
        .with_context(|| format!("cannot open input {}", a.input.display()))?;
    let tmp = temp_beside(&a.output)?;

    let mut writer = StreamWriter::new(
        BufWriter::new(tmp.as_file()),
        ResistMode::from(a.resist),
        cipher,
        &opts,
    )
    .context("encoding failed")?;
    io::copy(&mut BufReader::new(input), &mut writer).context("encoding failed")?;
    writer
        .finish()
        .context("encoding failed")?
        .flush()
        .context("encoding failed")?;

    persist_tempfile_atomic(tmp, &a.output, a.force)?;
    eprintln!("Wrote {}", a.output.display());
    Ok(())
}

fn cmd_decode(a: DecodeArgs) -> Result<()> {
    check_overwrite(&a.output, a.force)?;
    let input = fs::File::open(&a.input)
        .with_context(|| format!("cannot open input {}", a.input.display()))?;
    let mut source = BufReader::new(input);

    // The header says whether a password is needed; peek at it before prompting.
    let (header, _) = StreamHeader::read_from(&mut source).context("decoding failed")?;
    let mut opts = CodecOptions::default();
    if header.cipher_mode() == CipherMode::Aead {
        opts = opts.with_password(read_password(&a.password_file, "Password: ")?);
    }
    source.seek(SeekFrom::Start(0))?;

    let tmp = temp_beside(&a.output)?;
    {
        let mut reader =
            StreamReader::new(source, &opts).context("decoding failed")?;
        let mut out = BufWriter::new(tmp.as_file());
        io::copy(&mut reader, &mut out).context("decoding failed")?;
        out.flush().context("decoding failed")?;
        if reader.repaired_groups() > 0 {
            eprintln!("Repaired {} damaged group(s)", reader.repaired_groups());
        }
    }

    persist_tempfile_atomic(tmp, &a.output, a.force)?;
    eprintln!("Wrote {}", a.output.display());
    Ok(())
}

fn check_overwrite(out: &Path, force: bool) -> Result<()> {
    if out.exists() && !force {
        anyhow::bail!("output exists; use --force to overwrite");
    }
    Ok(())
}

/// Create a temporary file in the directory of `out` so the final rename
/// stays on one filesystem.
fn temp_beside(out: &Path) -> Result<NamedTempFile> {
    let dir = match out.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    NamedTempFile::new_in(dir)
        .with_context(|| format!("cannot create temporary file in {}", dir.display()))
}

/// Atomically persist a tempfile to the target path, honoring the force overwrite policy.
fn persist_tempfile_atomic(tmp: NamedTempFile, out: &Path, force: bool) -> Result<()> {
    let tmp_path = tmp.into_temp_path();
    if out.exists() {
        if force {
            fs::remove_file(out)?;
        } else {
            anyhow::bail!("output exists; use --force to overwrite");
        }
    }
    tmp_path
        .persist(out)
        .map_err(|e| e.error)
        .with_context(|| format!("cannot write {}", out.display()))?;
    Ok(())
}
