use clap::Parser;
use fxhash::FxHashSet as HashSet;
use racksolve::{
    CachedOracle, FrequencyGate, FrequencyRule, Lemmatizer, Optimizer, Options, Oracle,
    ScoreTable, StderrLog, Verdict,
};
use std::path::PathBuf;
use std::{fs, io, time};

#[derive(Parser, Clone, Debug)]
struct Args {
    #[clap(long, short = 'w', help = "word list, one word per line")]
    words: PathBuf,
    #[clap(long, short = 't', help = "scoring table in JSON: [[token, value], ...]")]
    table: PathBuf,
    /// Rack tiles, digraphs in parentheses. Example: -r '(qu) o t e'
    #[clap(long, short = 'r')]
    tiles: String,
    #[clap(long)]
    no_discard: bool,
    #[clap(long, default_value = "2")]
    min_letters: usize,
    #[clap(long, help = "opponent's longest word length to beat")]
    longest_to_beat: Option<usize>,
    #[clap(long, help = "opponent's word count to beat")]
    most_to_beat: Option<usize>,
    #[clap(long, default_value = "10")]
    longest_bonus: i32,
    #[clap(long, default_value = "10")]
    most_bonus: i32,
    #[clap(long, help = "frequency corpus in JSON: [[lemma, score, rank], ...]")]
    corpus: Option<PathBuf>,
    #[clap(long, default_value = "3.0")]
    min_frequency: f64,
    #[clap(long, default_value = "20000")]
    max_rank: u32,
    #[clap(long, help = "file of words the validity oracle rejects, one per line")]
    invalid_words: Option<PathBuf>,
}

/// Stand-in for a networked dictionary lookup: rejects a fixed word list.
struct FileOracle {
    invalid: HashSet<String>,
}

impl Oracle for FileOracle {
    fn check_batch(&self, words: &[String]) -> Verdict {
        let mut verdict = Verdict::default();
        for word in words {
            if self.invalid.contains(word) {
                verdict.invalid.insert(word.clone());
            } else {
                verdict.valid.insert(word.clone());
            }
        }
        verdict
    }
}

struct IdentityLemmatizer;

impl Lemmatizer for IdentityLemmatizer {
    fn lemma(&self, word: &str) -> String {
        word.to_owned()
    }
}

pub fn main() -> io::Result<()> {
    let args = Args::parse();

    let words: Vec<String> = fs::read_to_string(&args.words)?
        .lines()
        .map(|line| line.trim().to_owned())
        .collect();
    let entries: Vec<(String, i32)> = serde_json::from_str(&fs::read_to_string(&args.table)?)?;
    let entries: Vec<(&str, i32)> = entries.iter().map(|(t, v)| (t.as_str(), *v)).collect();
    let table = ScoreTable::new(&entries)?;
    println!("nw = {}, nt = {}", words.len(), table.len());

    let mut optimizer = Optimizer::new(table, words);
    let mut options = Options {
        min_letters: args.min_letters,
        no_discard: args.no_discard,
        current_longest: args.longest_to_beat,
        current_most: args.most_to_beat,
        longest_bonus: args.longest_bonus,
        most_bonus: args.most_bonus,
        ..Options::default()
    };
    if let Some(corpus) = &args.corpus {
        let entries: Vec<(String, f64, u32)> = serde_json::from_str(&fs::read_to_string(corpus)?)?;
        optimizer = optimizer.with_gate(Box::new(FrequencyGate::new(
            entries,
            Box::new(IdentityLemmatizer),
            FrequencyRule::Either,
            args.min_frequency,
            args.max_rank,
            true,
        )));
        options.common_only = true;
    }
    if let Some(invalid_words) = &args.invalid_words {
        let invalid: HashSet<String> = fs::read_to_string(invalid_words)?
            .lines()
            .map(|line| line.trim().to_lowercase())
            .collect();
        optimizer = optimizer.with_oracle(Box::new(CachedOracle::new(FileOracle { invalid })));
    }

    let t0 = time::Instant::now();
    let play = optimizer.optimize(&args.tiles, &options, &StderrLog)?;
    eprintln!("solve time = {:?}", t0.elapsed());
    println!("{}", serde_json::to_string_pretty(&play)?);

    Ok(())
}
