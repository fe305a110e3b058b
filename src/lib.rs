#![crate_type = "cdylib"]
#![crate_type = "lib"]

use float_ord::FloatOrd;
use fxhash::FxHashMap as HashMap;
use fxhash::FxHashSet as HashSet;
use lazy_static::lazy_static;
use serde::Serialize;
use smallvec::SmallVec;
use static_assertions::const_assert;
use std::sync::{Arc, Condvar, Mutex};
use std::{cmp, io, str, time};

#[cfg(target_arch = "wasm32")]
mod js;

fn error(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, message)
}

lazy_static! {
    static ref REFERENCE_INSTANT: time::Instant = time::Instant::now();
}

#[cfg(not(target_arch = "wasm32"))]
fn now() -> f64 {
    let reference = *REFERENCE_INSTANT; // This must run first!
    time::Instant::now().duration_since(reference).as_secs_f64()
}

#[cfg(target_arch = "wasm32")]
fn now() -> f64 {
    js::now() / 1e3
}

/// Longest word the largest round can hold: 10 tiles, each up to 2 letters.
pub const MAX_WORD_LETTERS: usize = 20;

/// Suggested transport bound for a single oracle round-trip.
pub const ORACLE_TIMEOUT: time::Duration = time::Duration::from_secs(8);

const MAX_TABLE_TOKENS: usize = 64;

pub trait Log {
    fn log(&self, message: &str);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StderrLog;

impl Log for StderrLog {
    fn log(&self, message: &str) {
        eprintln!("{}", message);
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TokenId(pub u8);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TokenDef {
    pub text: String,
    pub value: i32,
}

impl TokenDef {
    /// Two-letter tokens are digraphs: consumed and scored as one unit.
    pub fn is_digraph(&self) -> bool {
        self.text.len() == 2
    }
}

/// Point values for every playable tile, in table order.
#[derive(Clone, Debug, Default)]
pub struct ScoreTable {
    defs: Vec<TokenDef>,
    ids: HashMap<String, TokenId>,
}

const_assert!(MAX_TABLE_TOKENS <= u8::MAX as usize + 1);

impl ScoreTable {
    pub fn new(entries: &[(&str, i32)]) -> io::Result<Self> {
        let mut defs = Vec::default();
        let mut ids = HashMap::default();
        for &(text, value) in entries {
            let text = text.to_lowercase();
            if text.is_empty() || text.len() > 2 || !text.bytes().all(|b| b.is_ascii_lowercase())
            {
                return Err(error(&format!("invalid token: {:?}", text)));
            }
            if ids.contains_key(&text) {
                return Err(error(&format!("duplicate token: {:?}", text)));
            }
            if defs.len() >= MAX_TABLE_TOKENS {
                return Err(error("too many tokens in table"));
            }
            ids.insert(text.clone(), TokenId(defs.len() as u8));
            defs.push(TokenDef { text, value });
        }
        Ok(Self { defs, ids })
    }

    pub fn id(&self, text: &str) -> Option<TokenId> {
        self.ids.get(text).copied()
    }

    pub fn def(&self, TokenId(i): TokenId) -> &TokenDef {
        &self.defs[i as usize]
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    fn token_ids(&self) -> impl Iterator<Item = TokenId> {
        (0..self.defs.len() as u8).map(TokenId)
    }

    /// Table order with singles ahead of digraphs, the order used for
    /// reporting leftover tiles.
    fn report_order(&self) -> impl Iterator<Item = TokenId> + '_ {
        let singles = self.token_ids().filter(move |&id| !self.def(id).is_digraph());
        let digraphs = self.token_ids().filter(move |&id| self.def(id).is_digraph());
        singles.chain(digraphs)
    }
}

/// Splits raw rack text into table tokens. A parenthesized group or a
/// standalone chunk naming a registered digraph is one digraph token;
/// everything else is a run of single letters.
pub fn parse_tiles(raw: &str, table: &ScoreTable) -> io::Result<Vec<TokenId>> {
    fn single(table: &ScoreTable, c: char) -> io::Result<TokenId> {
        table
            .id(&c.to_lowercase().to_string())
            .ok_or_else(|| error(&format!("unknown tile: {:?}", c)))
    }

    let mut tokens = Vec::default();
    for chunk in raw.split_whitespace() {
        let chunk = chunk.to_lowercase();
        if let Some(id) = table.id(&chunk) {
            if table.def(id).is_digraph() {
                tokens.push(id);
                continue;
            }
        }
        let mut chars = chunk.chars();
        while let Some(c) = chars.next() {
            if c != '(' {
                tokens.push(single(table, c)?);
                continue;
            }
            let mut group = String::default();
            loop {
                match chars.next() {
                    Some(')') => break,
                    Some(g) => group.push(g),
                    None => return Err(error(&format!("unterminated '(' in {:?}", chunk))),
                }
            }
            match table.id(&group) {
                Some(id) if table.def(id).is_digraph() => tokens.push(id),
                _ => {
                    for g in group.chars() {
                        tokens.push(single(table, g)?);
                    }
                }
            }
        }
    }
    Ok(tokens)
}

/// The exact tile multiset a candidate consumes, kept sorted so equal
/// consumptions compare equal regardless of play order.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Usage(SmallVec<[TokenId; 8]>);

impl Usage {
    pub fn from_tokens(tokens: &[TokenId]) -> Self {
        let mut tokens: SmallVec<[TokenId; 8]> = tokens.into();
        tokens.sort_unstable();
        Self(tokens)
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.0
    }
}

/// Mutable tile counts for one search pass. Counts never go negative;
/// violating that is a bug in the caller's commit/rollback discipline.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Rack {
    counts: Vec<u8>,
}

impl Rack {
    pub fn from_tokens(table: &ScoreTable, tokens: &[TokenId]) -> Self {
        let mut counts = vec![0; table.len()];
        for &TokenId(i) in tokens {
            counts[i as usize] += 1;
        }
        Self { counts }
    }

    fn count(&self, TokenId(i): TokenId) -> u8 {
        self.counts[i as usize]
    }

    pub fn remaining_value(&self, table: &ScoreTable) -> i32 {
        table
            .token_ids()
            .map(|id| self.count(id) as i32 * table.def(id).value)
            .sum()
    }

    pub fn remaining_count(&self) -> usize {
        self.counts.iter().map(|&n| n as usize).sum()
    }

    pub fn remaining_tiles(&self, table: &ScoreTable) -> Vec<String> {
        let mut tiles = Vec::default();
        for id in table.report_order() {
            for _ in 0..self.count(id) {
                tiles.push(table.def(id).text.clone());
            }
        }
        tiles
    }

    /// Highest-value remaining tile; ties go to the first maximum in table
    /// order. `None` when the rack is spent.
    pub fn best_discard(&self, table: &ScoreTable) -> Option<TokenId> {
        let mut best: Option<TokenId> = None;
        for id in table.token_ids() {
            if self.count(id) == 0 {
                continue;
            }
            match best {
                Some(b) if table.def(b).value >= table.def(id).value => {}
                _ => best = Some(id),
            }
        }
        best
    }

    pub fn fits(&self, usage: &Usage) -> bool {
        let tokens = usage.tokens();
        let mut i = 0;
        while i < tokens.len() {
            let id = tokens[i];
            let mut need = 1;
            while i + need < tokens.len() && tokens[i + need] == id {
                need += 1;
            }
            if (self.count(id) as usize) < need {
                return false;
            }
            i += need;
        }
        true
    }

    pub fn apply(&mut self, usage: &Usage) {
        for &id in usage.tokens() {
            self.remove_one(id);
        }
    }

    pub fn revert(&mut self, usage: &Usage) {
        for &TokenId(i) in usage.tokens() {
            self.counts[i as usize] += 1;
        }
    }

    fn remove_one(&mut self, TokenId(i): TokenId) {
        assert!(self.counts[i as usize] > 0, "tile count went negative");
        self.counts[i as usize] -= 1;
    }

    fn add_one(&mut self, TokenId(i): TokenId) {
        self.counts[i as usize] += 1;
    }
}

#[derive(Clone, Debug, Default)]
struct TrieNode {
    children: HashMap<u8, TrieNode>,
    end: bool,
}

/// Prefix tree over the dictionary, read-only once built. Words longer than
/// `max_depth` are truncated and never marked complete: they cannot be
/// played whole within the rack horizon.
#[derive(Clone, Debug, Default)]
pub struct Trie {
    root: TrieNode,
    max_depth: usize,
}

impl Trie {
    pub fn build<'a>(words: impl IntoIterator<Item = &'a str>, max_depth: usize) -> Self {
        let mut root = TrieNode::default();
        for word in words {
            let word = word.trim().to_lowercase();
            if word.is_empty() || !word.bytes().all(|b| b.is_ascii_lowercase()) {
                continue;
            }
            let mut node = &mut root;
            for &b in word.as_bytes().iter().take(max_depth) {
                node = node.children.entry(b).or_default();
            }
            if word.len() <= max_depth {
                node.end = true;
            }
        }
        Self { root, max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }
}

/// Owns the dictionary and memoizes one trie per depth horizon, so repeated
/// searches share the build cost without process-global state.
#[derive(Debug, Default)]
pub struct TrieCache {
    words: Vec<String>,
    memo: Mutex<HashMap<usize, Arc<Trie>>>,
}

impl TrieCache {
    pub fn new(words: Vec<String>) -> Self {
        Self {
            words,
            memo: Mutex::default(),
        }
    }

    pub fn get(&self, max_depth: usize) -> Arc<Trie> {
        let mut memo = self.memo.lock().expect("trie cache lock poisoned");
        memo.entry(max_depth)
            .or_insert_with(|| {
                Arc::new(Trie::build(
                    self.words.iter().map(|w| w.as_str()),
                    max_depth,
                ))
            })
            .clone()
    }
}

/// A playable word together with the exact tiles that spell it. Two
/// candidates with the same letters but different usages stay distinct:
/// they drain different rack resources.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Candidate {
    pub plain: String,
    pub display: String,
    pub score: i32,
    pub letters: usize,
    pub usage: Usage,
}

/// Admission filter restricting candidates to sufficiently common words.
pub trait CommonGate {
    fn is_common(&self, word: &str) -> bool;
}

pub trait Lemmatizer {
    fn lemma(&self, word: &str) -> String;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrequencyRule {
    Score,
    Rank,
    Either,
    Both,
}

/// Frequency-corpus gate: a word is admitted if its lemma clears the
/// configured score/rank thresholds. Unknown lemmas are rejected. With
/// `admit_short`, 2-3 letter words pass unconditionally; short words are
/// routinely missing from frequency tables.
pub struct FrequencyGate {
    corpus: HashMap<String, (f64, u32)>,
    lemmatizer: Box<dyn Lemmatizer + Send + Sync>,
    rule: FrequencyRule,
    min_score: f64,
    max_rank: u32,
    admit_short: bool,
}

impl FrequencyGate {
    pub fn new(
        entries: impl IntoIterator<Item = (String, f64, u32)>,
        lemmatizer: Box<dyn Lemmatizer + Send + Sync>,
        rule: FrequencyRule,
        min_score: f64,
        max_rank: u32,
        admit_short: bool,
    ) -> Self {
        let corpus = entries
            .into_iter()
            .map(|(lemma, score, rank)| (lemma.to_lowercase(), (score, rank)))
            .collect();
        Self {
            corpus,
            lemmatizer,
            rule,
            min_score,
            max_rank,
            admit_short,
        }
    }
}

impl CommonGate for FrequencyGate {
    fn is_common(&self, word: &str) -> bool {
        if self.admit_short && (2..=3).contains(&word.len()) {
            return true;
        }
        let lemma = self.lemmatizer.lemma(word);
        let &(score, rank) = match self.corpus.get(&lemma) {
            Some(entry) => entry,
            None => return false,
        };
        let score_ok = score >= self.min_score;
        let rank_ok = rank <= self.max_rank;
        match self.rule {
            FrequencyRule::Score => score_ok,
            FrequencyRule::Rank => rank_ok,
            FrequencyRule::Either => score_ok || rank_ok,
            FrequencyRule::Both => score_ok && rank_ok,
        }
    }
}

struct Generator<'a> {
    table: &'a ScoreTable,
    rack: Rack,
    min_letters: usize,
    gate: Option<&'a dyn CommonGate>,
    path: Vec<u8>,
    stack: Vec<TokenId>,
    buckets: HashMap<String, Vec<Candidate>>,
}

/// Every distinct playable word from the rack, with per-word deduplication
/// by usage signature. Output order is unspecified; the selector sorts.
pub fn generate(
    trie: &Trie,
    table: &ScoreTable,
    rack: &Rack,
    min_letters: usize,
    gate: Option<&dyn CommonGate>,
) -> Vec<Candidate> {
    let mut generator = Generator {
        table,
        rack: rack.clone(),
        min_letters,
        gate,
        path: Vec::default(),
        stack: Vec::default(),
        buckets: HashMap::default(),
    };
    generator.descend(&trie.root);
    generator
        .buckets
        .into_iter()
        .flat_map(|(_, bucket)| bucket)
        .collect()
}

impl<'a> Generator<'a> {
    fn descend(&mut self, node: &TrieNode) {
        if node.end && self.path.len() >= self.min_letters {
            self.record();
        }
        for id in self.table.token_ids() {
            if self.rack.count(id) == 0 {
                continue;
            }
            let def = self.table.def(id);
            let bytes = def.text.as_bytes();
            if def.is_digraph() {
                let child = node
                    .children
                    .get(&bytes[0])
                    .and_then(|mid| mid.children.get(&bytes[1]));
                if let Some(child) = child {
                    self.rack.remove_one(id);
                    self.path.extend_from_slice(bytes);
                    self.stack.push(id);
                    self.descend(child);
                    self.stack.pop();
                    self.path.truncate(self.path.len() - 2);
                    self.rack.add_one(id);
                }
            } else if let Some(child) = node.children.get(&bytes[0]) {
                self.rack.remove_one(id);
                self.path.push(bytes[0]);
                self.stack.push(id);
                self.descend(child);
                self.stack.pop();
                self.path.pop();
                self.rack.add_one(id);
            }
        }
    }

    fn record(&mut self) {
        // A two-letter word spelled by its own digraph tile is not a play.
        if self.stack.len() == 1 && self.table.def(self.stack[0]).is_digraph() {
            return;
        }
        let plain = str::from_utf8(&self.path)
            .expect("trie path is ASCII")
            .to_owned();
        if let Some(gate) = self.gate {
            if !gate.is_common(&plain) {
                return;
            }
        }
        let usage = Usage::from_tokens(&self.stack);
        let bucket = self.buckets.entry(plain.clone()).or_default();
        if bucket.iter().any(|c| c.usage == usage) {
            return;
        }
        let mut display = String::default();
        let mut score = 0;
        for &id in &self.stack {
            let def = self.table.def(id);
            if def.is_digraph() {
                display.push('(');
                display.push_str(&def.text);
                display.push(')');
            } else {
                display.push_str(&def.text);
            }
            score += def.value;
        }
        bucket.push(Candidate {
            plain,
            display,
            score,
            letters: self.path.len(),
            usage,
        });
    }
}

#[derive(Clone, Debug)]
pub struct PlayParams {
    pub no_discard: bool,
    /// Longest-word threshold to beat; `None` means no bonus is possible.
    pub current_longest: Option<usize>,
    /// Word-count threshold to beat; `None` means no bonus is possible.
    pub current_most: Option<usize>,
    pub longest_bonus: i32,
    pub most_bonus: i32,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct PlayedWord {
    pub plain: String,
    pub display: String,
    pub score: i32,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct BestPlay {
    pub words: Vec<PlayedWord>,
    pub base_score: i32,
    pub penalty: i32,
    pub discard: Option<String>,
    pub unused: Vec<String>,
    pub longest_letters: usize,
    pub word_count: usize,
    pub longest_bonus: i32,
    pub most_bonus: i32,
    pub total: i32,
}

struct Chooser<'a> {
    table: &'a ScoreTable,
    params: &'a PlayParams,
    candidates: Vec<&'a Candidate>,
    rack: Rack,
    chosen: Vec<&'a Candidate>,
    base: i32,
    best: Option<BestPlay>,
    best_total: i32,
}

/// Branch-and-bound over non-overlapping candidate subsets, maximizing base
/// score minus leftover penalty plus strict-threshold bonuses.
pub fn choose(
    candidates: &[Candidate],
    table: &ScoreTable,
    rack: &Rack,
    params: &PlayParams,
) -> BestPlay {
    let mut ordered: Vec<&Candidate> = candidates.iter().collect();
    // Dense scorers first; pure pruning heuristic, the search stays exhaustive.
    ordered.sort_unstable_by_key(|c| {
        cmp::Reverse((
            FloatOrd(c.score as f64 / c.letters as f64),
            c.score,
            c.letters,
        ))
    });
    let mut chooser = Chooser {
        table,
        params,
        candidates: ordered,
        rack: rack.clone(),
        chosen: Vec::default(),
        base: 0,
        best: None,
        best_total: i32::MIN,
    };
    chooser.search(0);
    chooser.best.unwrap_or_default()
}

impl<'a> Chooser<'a> {
    fn possible_bonuses(&self) -> i32 {
        let mut bonuses = 0;
        if self.params.current_longest.is_some() {
            bonuses += self.params.longest_bonus;
        }
        if self.params.current_most.is_some() {
            bonuses += self.params.most_bonus;
        }
        bonuses
    }

    fn search(&mut self, i: usize) {
        // "Keep everything, earn every bonus" over-estimates any completion.
        let bound = self.base + self.rack.remaining_value(self.table) + self.possible_bonuses();
        if bound <= self.best_total {
            return;
        }
        if i == self.candidates.len() {
            self.evaluate();
            return;
        }
        let candidate = self.candidates[i];
        if self.rack.fits(&candidate.usage) {
            self.rack.apply(&candidate.usage);
            self.base += candidate.score;
            self.chosen.push(candidate);
            self.search(i + 1);
            self.chosen.pop();
            self.base -= candidate.score;
            self.rack.revert(&candidate.usage);
        }
        self.search(i + 1);
    }

    fn evaluate(&mut self) {
        let leftover = self.rack.remaining_value(self.table);
        let (discard, penalty) = if self.params.no_discard {
            (None, leftover)
        } else {
            match self.rack.best_discard(self.table) {
                // Nothing left to set aside; the round requires a discard.
                None => return,
                Some(id) => (Some(id), leftover - self.table.def(id).value),
            }
        };
        let longest = self.chosen.iter().map(|c| c.letters).max().unwrap_or(0);
        let count = self.chosen.len();
        let longest_bonus = match self.params.current_longest {
            Some(threshold) if longest > threshold => self.params.longest_bonus,
            _ => 0,
        };
        let most_bonus = match self.params.current_most {
            Some(threshold) if count > threshold => self.params.most_bonus,
            _ => 0,
        };
        let total = cmp::max(self.base - penalty, 0) + longest_bonus + most_bonus;
        if total <= self.best_total {
            return;
        }
        let mut rest = self.rack.clone();
        if let Some(id) = discard {
            rest.remove_one(id);
        }
        self.best_total = total;
        self.best = Some(BestPlay {
            words: self
                .chosen
                .iter()
                .map(|c| PlayedWord {
                    plain: c.plain.clone(),
                    display: c.display.clone(),
                    score: c.score,
                })
                .collect(),
            base_score: self.base,
            penalty,
            discard: discard.map(|id| self.table.def(id).text.clone()),
            unused: rest.remaining_tiles(self.table),
            longest_letters: longest,
            word_count: count,
            longest_bonus,
            most_bonus,
            total,
        });
    }
}

/// Batch verdict from the validity oracle. Words in neither set are
/// indeterminate (transport failure or timeout) and pass as valid.
#[derive(Clone, Debug, Default)]
pub struct Verdict {
    pub valid: HashSet<String>,
    pub invalid: HashSet<String>,
}

pub trait Oracle {
    fn check_batch(&self, words: &[String]) -> Verdict;
}

#[derive(Debug, Default)]
struct OracleCacheState {
    verdicts: HashMap<String, bool>,
    in_flight: HashSet<String>,
}

/// Word-keyed verdict cache over any oracle. Definitive answers are cached;
/// indeterminate ones are not, so a transient failure can be retried later.
/// Concurrent lookups of an in-flight word wait for the one round-trip
/// instead of issuing another.
pub struct CachedOracle<O> {
    inner: O,
    state: Mutex<OracleCacheState>,
    settled: Condvar,
}

impl<O> CachedOracle<O> {
    pub fn new(inner: O) -> Self {
        Self {
            inner,
            state: Mutex::default(),
            settled: Condvar::new(),
        }
    }
}

impl<O: Oracle> Oracle for CachedOracle<O> {
    fn check_batch(&self, words: &[String]) -> Verdict {
        let mut verdict = Verdict::default();
        let mut to_fetch = Vec::default();
        let mut to_await = Vec::default();
        {
            let mut state = self.state.lock().expect("oracle cache lock poisoned");
            for word in words {
                match state.verdicts.get(word) {
                    Some(true) => {
                        verdict.valid.insert(word.clone());
                    }
                    Some(false) => {
                        verdict.invalid.insert(word.clone());
                    }
                    None if state.in_flight.contains(word) => to_await.push(word.clone()),
                    None => {
                        state.in_flight.insert(word.clone());
                        to_fetch.push(word.clone());
                    }
                }
            }
        }
        if !to_fetch.is_empty() {
            let fetched = self.inner.check_batch(&to_fetch);
            let mut state = self.state.lock().expect("oracle cache lock poisoned");
            for word in &to_fetch {
                state.in_flight.remove(word);
                if fetched.invalid.contains(word) {
                    state.verdicts.insert(word.clone(), false);
                    verdict.invalid.insert(word.clone());
                } else {
                    if fetched.valid.contains(word) {
                        state.verdicts.insert(word.clone(), true);
                    }
                    verdict.valid.insert(word.clone());
                }
            }
            self.settled.notify_all();
        }
        if !to_await.is_empty() {
            let mut state = self.state.lock().expect("oracle cache lock poisoned");
            while to_await.iter().any(|word| state.in_flight.contains(word)) {
                state = self
                    .settled
                    .wait(state)
                    .expect("oracle cache lock poisoned");
            }
            for word in &to_await {
                if state.verdicts.get(word) == Some(&false) {
                    verdict.invalid.insert(word.clone());
                } else {
                    verdict.valid.insert(word.clone());
                }
            }
        }
        verdict
    }
}

#[derive(Clone, Debug)]
pub struct Options {
    pub min_letters: usize,
    pub no_discard: bool,
    pub current_longest: Option<usize>,
    pub current_most: Option<usize>,
    pub longest_bonus: i32,
    pub most_bonus: i32,
    pub common_only: bool,
    pub max_refine_rounds: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            min_letters: 2,
            no_discard: false,
            current_longest: None,
            current_most: None,
            longest_bonus: 10,
            most_bonus: 10,
            common_only: false,
            max_refine_rounds: 5,
        }
    }
}

impl Options {
    fn params(&self) -> PlayParams {
        PlayParams {
            no_discard: self.no_discard,
            current_longest: self.current_longest,
            current_most: self.current_most,
            longest_bonus: self.longest_bonus,
            most_bonus: self.most_bonus,
        }
    }
}

/// Wires the pieces together: tile parsing, the memoized trie, candidate
/// generation, selection, and the optional oracle refinement loop.
pub struct Optimizer {
    table: ScoreTable,
    trie_cache: TrieCache,
    gate: Option<Box<dyn CommonGate + Send + Sync>>,
    oracle: Option<Box<dyn Oracle + Send + Sync>>,
}

impl Optimizer {
    pub fn new(table: ScoreTable, dictionary: Vec<String>) -> Self {
        Self {
            table,
            trie_cache: TrieCache::new(dictionary),
            gate: None,
            oracle: None,
        }
    }

    pub fn with_gate(mut self, gate: Box<dyn CommonGate + Send + Sync>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_oracle(mut self, oracle: Box<dyn Oracle + Send + Sync>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn table(&self) -> &ScoreTable {
        &self.table
    }

    pub fn optimize(
        &self,
        raw_tiles: &str,
        options: &Options,
        log: &dyn Log,
    ) -> io::Result<BestPlay> {
        let tokens = parse_tiles(raw_tiles, &self.table)?;
        let rack = Rack::from_tokens(&self.table, &tokens);
        let capacity: usize = tokens
            .iter()
            .map(|&id| self.table.def(id).text.len())
            .sum();
        let trie = self.trie_cache.get(cmp::min(capacity, MAX_WORD_LETTERS));

        let gate = if options.common_only {
            self.gate.as_deref().map(|g| g as &dyn CommonGate)
        } else {
            None
        };
        let t0 = now();
        let mut pool = generate(&trie, &self.table, &rack, options.min_letters, gate);
        log.log(&format!(
            "generated {} candidates in {:.3}s",
            pool.len(),
            now() - t0
        ));

        let params = options.params();
        let t0 = now();
        let mut play = choose(&pool, &self.table, &rack, &params);
        log.log(&format!(
            "chose {} words for {} points in {:.3}s",
            play.word_count,
            play.total,
            now() - t0
        ));

        if let Some(oracle) = &self.oracle {
            for round in 0..options.max_refine_rounds {
                if play.words.is_empty() {
                    break;
                }
                let plains: Vec<String> = play.words.iter().map(|w| w.plain.clone()).collect();
                let verdict = oracle.check_batch(&plains);
                let invalid: HashSet<String> = plains
                    .iter()
                    .filter(|w| verdict.invalid.contains(*w))
                    .cloned()
                    .collect();
                if invalid.is_empty() {
                    break;
                }
                let before = pool.len();
                pool.retain(|c| !invalid.contains(&c.plain));
                log.log(&format!(
                    "refine round {}: oracle rejected {:?}, {} of {} candidates dropped",
                    round + 1,
                    invalid.iter().collect::<Vec<_>>(),
                    before - pool.len(),
                    before
                ));
                play = choose(&pool, &self.table, &rack, &params);
            }
        }
        Ok(play)
    }
}

#[cfg(target_arch = "wasm32")]
fn solve(
    tiles: &str,
    words: &str,
    table: Vec<(String, i32)>,
    options: &Options,
    log: &dyn Log,
) -> io::Result<()> {
    if words.is_empty() {
        return Err(error("Please upload a word list first."));
    }
    let entries: Vec<(&str, i32)> = table.iter().map(|(t, v)| (t.as_str(), *v)).collect();
    let table = ScoreTable::new(&entries)?;
    let dictionary: Vec<String> = words.lines().map(|line| line.trim().to_owned()).collect();
    let optimizer = Optimizer::new(table, dictionary);
    js::update_status(format!("Solving..."));
    let play = {
        let _timer = js::Timer::from("solve");
        optimizer.optimize(tiles, options, log)?
    };
    js::Reply::ReportPlay { play }.post();
    js::update_status(format!("Done!"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn table() -> ScoreTable {
        ScoreTable::new(&[
            ("a", 2),
            ("b", 8),
            ("c", 8),
            ("d", 5),
            ("e", 2),
            ("f", 6),
            ("g", 6),
            ("h", 7),
            ("i", 2),
            ("j", 13),
            ("k", 8),
            ("l", 3),
            ("m", 5),
            ("n", 5),
            ("o", 2),
            ("p", 6),
            ("q", 15),
            ("r", 5),
            ("s", 3),
            ("t", 3),
            ("u", 4),
            ("v", 11),
            ("w", 10),
            ("x", 12),
            ("y", 4),
            ("z", 14),
            ("qu", 9),
            ("in", 7),
            ("er", 7),
            ("cl", 10),
            ("th", 9),
        ])
        .unwrap()
    }

    fn rack(table: &ScoreTable, raw: &str) -> Rack {
        Rack::from_tokens(table, &parse_tiles(raw, table).unwrap())
    }

    fn candidates(table: &ScoreTable, dictionary: &[&str], raw: &str) -> Vec<Candidate> {
        let trie = Trie::build(dictionary.iter().copied(), MAX_WORD_LETTERS);
        generate(&trie, table, &rack(table, raw), 2, None)
    }

    fn optimizer(dictionary: &[&str]) -> Optimizer {
        Optimizer::new(table(), dictionary.iter().map(|w| w.to_string()).collect())
    }

    struct NullLog;

    impl Log for NullLog {
        fn log(&self, _message: &str) {}
    }

    struct ListOracle {
        invalid: HashSet<String>,
        indeterminate: HashSet<String>,
        calls: AtomicUsize,
        words_seen: Mutex<Vec<String>>,
    }

    impl ListOracle {
        fn rejecting(words: &[&str]) -> Self {
            Self {
                invalid: words.iter().map(|w| w.to_string()).collect(),
                indeterminate: HashSet::default(),
                calls: AtomicUsize::new(0),
                words_seen: Mutex::default(),
            }
        }
    }

    impl Oracle for ListOracle {
        fn check_batch(&self, words: &[String]) -> Verdict {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.words_seen
                .lock()
                .unwrap()
                .extend(words.iter().cloned());
            let mut verdict = Verdict::default();
            for word in words {
                if self.indeterminate.contains(word) {
                    continue;
                }
                if self.invalid.contains(word) {
                    verdict.invalid.insert(word.clone());
                } else {
                    verdict.valid.insert(word.clone());
                }
            }
            verdict
        }
    }

    fn tile_texts(table: &ScoreTable, raw: &str) -> Vec<String> {
        parse_tiles(raw, table)
            .unwrap()
            .iter()
            .map(|&id| table.def(id).text.clone())
            .collect()
    }

    #[test]
    fn parse_tiles_forms() {
        let table = table();
        for (raw, expected) in [
            ("(qu)ote", vec!["qu", "o", "t", "e"]),
            ("qu o t e", vec!["qu", "o", "t", "e"]),
            ("QU", vec!["qu"]),
            ("cat", vec!["c", "a", "t"]),
            ("a (th) b", vec!["a", "th", "b"]),
            ("(ab)c", vec!["a", "b", "c"]),
        ] {
            assert_eq!(tile_texts(&table, raw), expected, "{}", raw);
        }
        assert!(parse_tiles("a1", &table).is_err());
        assert!(parse_tiles("(qu", &table).is_err());
    }

    #[test]
    fn trie_depth_cap() {
        let trie = Trie::build(["hello", "hi"], 3);
        let h = trie.root.children.get(&b'h').unwrap();
        assert!(h.children.get(&b'i').unwrap().end);
        let hel = h.children.get(&b'e').unwrap().children.get(&b'l').unwrap();
        assert!(!hel.end);
        assert!(hel.children.is_empty());
    }

    #[test]
    fn trie_skips_non_alphabetic() {
        let trie = Trie::build(["don't", "", "ok"], 5);
        assert_eq!(trie.root.children.len(), 1);
    }

    #[test]
    fn trie_empty_dictionary() {
        let trie = Trie::build([], 5);
        assert!(trie.root.children.is_empty());
        assert!(!trie.root.end);
    }

    #[test]
    fn trie_cache_memoizes_per_depth() {
        let cache = TrieCache::new(vec!["cat".to_owned()]);
        let a = cache.get(5);
        let b = cache.get(5);
        assert!(Arc::ptr_eq(&a, &b));
        let c = cache.get(2);
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn rack_accounting() {
        let table = table();
        let rack = rack(&table, "(qu) a (th) b");
        assert_eq!(rack.remaining_count(), 4);
        assert_eq!(rack.remaining_value(&table), 9 + 2 + 9 + 8);
        // Singles first, then digraphs, both in table order.
        assert_eq!(rack.remaining_tiles(&table), ["a", "b", "qu", "th"]);
    }

    #[test]
    fn rack_fits_apply_revert() {
        let table = table();
        let mut rack = rack(&table, "c a t a");
        let a = table.id("a").unwrap();
        let c = table.id("c").unwrap();
        let double_a = Usage::from_tokens(&[a, a]);
        let triple_a = Usage::from_tokens(&[a, a, a]);
        assert!(rack.fits(&double_a));
        assert!(!rack.fits(&triple_a));
        rack.apply(&double_a);
        assert!(!rack.fits(&double_a));
        assert!(rack.fits(&Usage::from_tokens(&[c])));
        rack.revert(&double_a);
        assert!(rack.fits(&double_a));
    }

    #[test]
    fn best_discard_prefers_first_maximum() {
        let table = table();
        // e and o are both worth 2; e comes first in the table.
        assert_eq!(
            rack(&table, "e o").best_discard(&table),
            Some(table.id("e").unwrap())
        );
        assert_eq!(
            rack(&table, "a b c").best_discard(&table),
            Some(table.id("b").unwrap())
        );
        assert_eq!(rack(&table, "").best_discard(&table), None);
    }

    #[test]
    fn lone_digraph_is_not_a_candidate() {
        let table = table();
        assert!(candidates(&table, &["qu"], "(qu)").is_empty());
        // Spelled from singles it is a legitimate two-tile word.
        let from_singles = candidates(&table, &["in"], "i n");
        assert_eq!(from_singles.len(), 1);
        assert_eq!(from_singles[0].display, "in");
        assert!(candidates(&table, &["in"], "(in)").is_empty());
    }

    #[test]
    fn digraph_needs_two_level_chain() {
        let table = table();
        // "it" offers i->t in the trie; the (in) tile needs i->n.
        assert!(candidates(&table, &["it"], "(in) t").is_empty());
        assert_eq!(candidates(&table, &["int"], "(in) t").len(), 1);
    }

    #[test]
    fn distinct_usages_are_kept_apart() {
        let table = table();
        let mut found = candidates(&table, &["quote"], "(qu) q u o t e");
        found.sort_by(|a, b| a.display.cmp(&b.display));
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].display, "(qu)ote");
        assert_eq!(found[0].score, 9 + 2 + 3 + 2);
        assert_eq!(found[0].letters, 5);
        assert_eq!(found[1].display, "quote");
        assert_eq!(found[1].score, 15 + 4 + 2 + 3 + 2);
        assert_ne!(found[0].usage, found[1].usage);
    }

    #[test]
    fn generator_respects_tile_counts() {
        let table = table();
        assert!(candidates(&table, &["aa"], "a").is_empty());
        assert_eq!(candidates(&table, &["aa"], "a a").len(), 1);
    }

    #[test]
    fn generator_honors_min_letters() {
        let table = table();
        let trie = Trie::build(["at", "a"], MAX_WORD_LETTERS);
        let found = generate(&trie, &table, &rack(&table, "a t"), 2, None);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].plain, "at");
    }

    #[test]
    fn frequency_gate_rules() {
        struct Id;
        impl Lemmatizer for Id {
            fn lemma(&self, word: &str) -> String {
                word.to_owned()
            }
        }
        let corpus = vec![("rare".to_owned(), 1.0, 50)];
        for (rule, expected) in [
            (FrequencyRule::Score, false),
            (FrequencyRule::Rank, true),
            (FrequencyRule::Either, true),
            (FrequencyRule::Both, false),
        ] {
            let gate = FrequencyGate::new(corpus.clone(), Box::new(Id), rule, 2.0, 100, false);
            assert_eq!(gate.is_common("rare"), expected, "{:?}", rule);
        }
        let gate = FrequencyGate::new(
            corpus.clone(),
            Box::new(Id),
            FrequencyRule::Both,
            2.0,
            100,
            true,
        );
        // Unknown lemmas are rejected, but short words skip the corpus.
        assert!(!gate.is_common("missing"));
        assert!(gate.is_common("cat"));
        assert!(gate.is_common("at"));
    }

    #[test]
    fn gate_filters_generation() {
        struct OnlyCat;
        impl CommonGate for OnlyCat {
            fn is_common(&self, word: &str) -> bool {
                word == "cat"
            }
        }
        let table = table();
        let trie = Trie::build(["cat", "act"], MAX_WORD_LETTERS);
        let found = generate(&trie, &table, &rack(&table, "c a t"), 2, Some(&OnlyCat));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].plain, "cat");
    }

    fn params(no_discard: bool) -> PlayParams {
        PlayParams {
            no_discard,
            current_longest: None,
            current_most: None,
            longest_bonus: 10,
            most_bonus: 10,
        }
    }

    #[test]
    fn single_word_uses_whole_rack() {
        let table = table();
        let pool = candidates(&table, &["quote"], "(qu) o t e");
        let play = choose(&pool, &table, &rack(&table, "(qu) o t e"), &params(true));
        assert_eq!(play.word_count, 1);
        assert_eq!(play.words[0].display, "(qu)ote");
        assert_eq!(play.base_score, 16);
        assert_eq!(play.penalty, 0);
        assert!(play.unused.is_empty());
        assert_eq!(play.total, 16);
    }

    #[test]
    fn wordless_rack_discards_best_tile() {
        let table = table();
        let rack = rack(&table, "a a a");
        let play = choose(&[], &table, &rack, &params(false));
        assert!(play.words.is_empty());
        assert_eq!(play.discard.as_deref(), Some("a"));
        assert_eq!(play.unused, ["a", "a"]);
        assert_eq!(play.penalty, 4);
        assert_eq!(play.total, 0);

        let play = choose(&[], &table, &rack, &params(true));
        assert_eq!(play.discard, None);
        assert_eq!(play.unused, ["a", "a", "a"]);
        assert_eq!(play.penalty, 6);
        assert_eq!(play.total, 0);
    }

    #[test]
    fn non_overlapping_words_combine() {
        let table = table();
        let pool = candidates(&table, &["cat", "dog"], "c a t d o g");
        let play = choose(&pool, &table, &rack(&table, "c a t d o g"), &params(true));
        assert_eq!(play.word_count, 2);
        assert_eq!(play.base_score, 13 + 13);
        assert_eq!(play.penalty, 0);
        assert_eq!(play.total, 26);
    }

    #[test]
    fn bonus_thresholds_are_strict() {
        let table = table();
        let pool = candidates(&table, &["cat", "dog"], "c a t d o g");
        let rack = rack(&table, "c a t d o g");
        let mut p = params(true);
        p.current_most = Some(2);
        p.current_longest = Some(3);
        let play = choose(&pool, &table, &rack, &p);
        // Two words and three letters only tie the thresholds.
        assert_eq!(play.word_count, 2);
        assert_eq!(play.most_bonus, 0);
        assert_eq!(play.longest_bonus, 0);
        assert_eq!(play.total, 26);

        p.current_most = Some(1);
        p.current_longest = Some(2);
        let play = choose(&pool, &table, &rack, &p);
        assert_eq!(play.most_bonus, 10);
        assert_eq!(play.longest_bonus, 10);
        assert_eq!(play.total, 46);
    }

    #[test]
    fn selector_backtracks_past_greedy_order() {
        let table = table();
        // "ox" scores densest per letter but blocks the better "axe".
        let pool = candidates(&table, &["ox", "axe"], "a x e o");
        let play = choose(&pool, &table, &rack(&table, "a x e o"), &params(true));
        assert_eq!(play.words.len(), 1);
        assert_eq!(play.words[0].plain, "axe");
        assert_eq!(play.total, 16 - 2);
    }

    #[test]
    fn digraph_atomicity_blocks_double_spend() {
        let table = table();
        let raw = "(qu) i t a d";
        let pool = candidates(&table, &["quit", "quad"], raw);
        assert_eq!(pool.len(), 2);
        let play = choose(&pool, &table, &rack(&table, raw), &params(true));
        // Both words need the lone (qu) tile, so only one can be played.
        assert_eq!(play.word_count, 1);
    }

    #[test]
    fn pre_bonus_score_floors_at_zero() {
        let table = table();
        let pool = candidates(&table, &["at"], "a t j");
        let mut p = params(true);
        p.current_most = Some(0);
        let play = choose(&pool, &table, &rack(&table, "a t j"), &p);
        // at = 5, leftover j = 13; the negative base never eats the bonus.
        assert_eq!(play.word_count, 1);
        assert_eq!(play.total, 10);
    }

    #[test]
    fn removing_discard_never_helps() {
        let table = table();
        let raw = "c a t e";
        let pool = candidates(&table, &["cat"], raw);
        let rack = rack(&table, raw);
        let with_discard = choose(&pool, &table, &rack, &params(false));
        let without = choose(&pool, &table, &rack, &params(true));
        assert_eq!(with_discard.total, 13);
        assert_eq!(without.total, 11);
        assert!(without.total <= with_discard.total);
    }

    #[test]
    fn removing_bonus_eligibility_never_helps() {
        let table = table();
        let raw = "c a t d o g";
        let pool = candidates(&table, &["cat", "dog"], raw);
        let rack = rack(&table, raw);
        let plain = choose(&pool, &table, &rack, &params(true));
        let mut p = params(true);
        p.current_most = Some(1);
        let with_bonus = choose(&pool, &table, &rack, &p);
        assert!(plain.total <= with_bonus.total);
    }

    #[test]
    fn perfect_play_is_skipped_when_discard_is_required() {
        let table = table();
        let raw = "(qu) o t e";
        let pool = candidates(&table, &["quote"], raw);
        let play = choose(&pool, &table, &rack(&table, raw), &params(false));
        // Playing every tile leaves nothing to discard, so the word is passed over.
        assert!(play.words.is_empty());
    }

    #[test]
    fn resource_conservation() {
        let table = table();
        let raw = "c a t d o g e";
        let pool = candidates(&table, &["cat", "dog"], raw);
        let play = choose(&pool, &table, &rack(&table, raw), &params(false));
        assert_eq!(play.word_count, 2);
        assert_eq!(play.discard.as_deref(), Some("e"));
        let mut spent: Vec<String> = Vec::default();
        for word in &play.words {
            spent.extend(tile_texts(&table, &word.display));
        }
        spent.extend(play.discard.iter().cloned());
        spent.extend(play.unused.iter().cloned());
        spent.sort();
        let mut original = tile_texts(&table, raw);
        original.sort();
        assert_eq!(spent, original);
    }

    #[test]
    fn empty_rack_yields_empty_play() {
        let table = table();
        let play = choose(&[], &table, &rack(&table, ""), &params(false));
        assert_eq!(play, BestPlay::default());
    }

    #[test]
    fn optimize_end_to_end() {
        let optimizer = optimizer(&["QUOTE", "TOE"]);
        let options = Options {
            no_discard: true,
            ..Options::default()
        };
        let play = optimizer.optimize("(qu) o t e", &options, &NullLog).unwrap();
        assert_eq!(play.words[0].display, "(qu)ote");
        assert_eq!(play.total, 16);
    }

    #[test]
    fn refinement_drops_invalid_words() {
        let oracle = ListOracle::rejecting(&["cats"]);
        let optimizer =
            optimizer(&["cats", "cat"]).with_oracle(Box::new(CachedOracle::new(oracle)));
        let options = Options {
            no_discard: true,
            ..Options::default()
        };
        let play = optimizer.optimize("c a t s", &options, &NullLog).unwrap();
        assert_eq!(play.words.len(), 1);
        assert_eq!(play.words[0].plain, "cat");
        assert_eq!(play.total, 13 - 3);
    }

    #[test]
    fn refinement_exhaustion_degrades_to_empty_play() {
        let oracle = ListOracle::rejecting(&["cats"]);
        let optimizer = optimizer(&["cats"]).with_oracle(Box::new(oracle));
        let options = Options {
            no_discard: true,
            ..Options::default()
        };
        let play = optimizer.optimize("c a t s", &options, &NullLog).unwrap();
        assert!(play.words.is_empty());
        assert_eq!(play.unused.len(), 4);
        assert_eq!(play.total, 0);
    }

    #[test]
    fn cached_oracle_serves_definitive_verdicts_once() {
        let oracle = CachedOracle::new(ListOracle::rejecting(&["bogus"]));
        let batch = vec!["bogus".to_owned(), "fine".to_owned()];
        let first = oracle.check_batch(&batch);
        assert!(first.invalid.contains("bogus"));
        assert!(first.valid.contains("fine"));
        let second = oracle.check_batch(&batch);
        assert_eq!(second.invalid, first.invalid);
        assert_eq!(oracle.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cached_oracle_retries_indeterminate_words() {
        let mut inner = ListOracle::rejecting(&[]);
        inner.indeterminate.insert("flaky".to_owned());
        let oracle = CachedOracle::new(inner);
        let batch = vec!["flaky".to_owned()];
        // Indeterminate answers pass as valid but are never cached.
        assert!(oracle.check_batch(&batch).valid.contains("flaky"));
        assert!(oracle.check_batch(&batch).valid.contains("flaky"));
        assert_eq!(oracle.inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(*oracle.inner.words_seen.lock().unwrap(), ["flaky", "flaky"]);
    }
}
