use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::Sender;
use tokio::time::{Duration, sleep};

use crate::config::WordlistOptions;

/// One unit of work: the substitution value for each wordlist position,
/// extension already applied.
pub type Job = Vec<String>;

/// Streams position tuples from the wordlists into the job channel.
///
/// Brute mode enumerates the cartesian product of the wordlists by
/// recursing one file per position, re-reading deeper files per prefix so
/// memory stays flat regardless of wordlist size. Combo mode walks all
/// files in lockstep. Every tuple is multiplied by the extension list, and
/// emission is paced to the configured request rate.
pub struct JobGenerator {
    files: Vec<PathBuf>,
    extensions: Vec<String>,
    no_brute: bool,
    rate: f64,
}

impl JobGenerator {
    pub fn new(wordlists: &WordlistOptions, rate: f64) -> Self {
        Self {
            files: wordlists.files.clone(),
            extensions: wordlists.extensions.clone(),
            no_brute: wordlists.no_brute,
            rate,
        }
    }

    /// One full pass over the wordlists. DoS mode calls this in a loop.
    pub async fn run(&self, tx: &Sender<Job>) -> Result<()> {
        if self.no_brute {
            self.combo(tx).await
        } else {
            self.brute(Vec::new(), 0, tx).await
        }
    }

    fn brute<'a>(
        &'a self,
        current: Job,
        index: usize,
        tx: &'a Sender<Job>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            if index >= self.files.len() {
                return self.emit(current, tx).await;
            }
            let path = &self.files[index];
            let file = File::open(path)
                .await
                .with_context(|| format!("error opening {}", path.display()))?;
            let mut lines = BufReader::new(file).lines();
            while let Some(line) = lines.next_line().await? {
                let mut next = current.clone();
                next.push(line);
                self.brute(next, index + 1, tx).await?;
            }
            Ok(())
        }
        .boxed()
    }

    async fn combo(&self, tx: &Sender<Job>) -> Result<()> {
        let mut readers = Vec::with_capacity(self.files.len());
        for path in &self.files {
            let file = File::open(path)
                .await
                .with_context(|| format!("error opening {}", path.display()))?;
            readers.push(BufReader::new(file).lines());
        }
        if readers.is_empty() {
            return self.emit(Vec::new(), tx).await;
        }
        loop {
            let mut tuple = Vec::with_capacity(readers.len());
            for lines in &mut readers {
                // an exhausted or blank line ends the whole zip
                match lines.next_line().await? {
                    Some(line) if !line.is_empty() => tuple.push(line),
                    _ => return Ok(()),
                }
            }
            self.emit(tuple, tx).await?;
        }
    }

    async fn emit(&self, tuple: Job, tx: &Sender<Job>) -> Result<()> {
        if self.extensions.is_empty() {
            return self.send(tuple, tx).await;
        }
        for ext in &self.extensions {
            let job = tuple.iter().map(|pos| format!("{pos}{ext}")).collect();
            self.send(job, tx).await?;
        }
        Ok(())
    }

    async fn send(&self, job: Job, tx: &Sender<Job>) -> Result<()> {
        if self.rate > 0.0 {
            sleep(Duration::from_secs_f64(1.0 / self.rate)).await;
        }
        tx.send(job).await.map_err(|_| anyhow!("job channel closed"))
    }
}

/// Computes the total number of jobs one generator pass will emit:
/// the product (brute) or minimum (combo) of the wordlist line counts,
/// multiplied by the extension count. An empty wordlist is a setup error.
pub async fn count_jobs(
    files: &[PathBuf],
    no_brute: bool,
    extensions: &[String],
) -> Result<u64> {
    let mut total: u64 = 0;
    for (idx, path) in files.iter().enumerate() {
        let len = file_len(path).await?;
        if len == 0 {
            bail!("empty file: {}", path.display());
        }
        total = if idx == 0 {
            len
        } else if no_brute {
            total.min(len)
        } else {
            total.saturating_mul(len)
        };
    }
    Ok(total.saturating_mul(extensions.len().max(1) as u64))
}

async fn file_len(path: &Path) -> Result<u64> {
    let file = File::open(path)
        .await
        .with_context(|| format!("error opening {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut count = 0;
    while lines.next_line().await?.is_some() {
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::sync::mpsc;

    fn wordlist(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp wordlist");
        file.write_all(content.as_bytes()).expect("write wordlist");
        file
    }

    fn options(files: &[&tempfile::NamedTempFile], exts: &[&str], no_brute: bool) -> WordlistOptions {
        WordlistOptions {
            no_brute,
            extensions: exts.iter().map(|e| e.to_string()).collect(),
            files: files.iter().map(|f| f.path().to_path_buf()).collect(),
        }
    }

    async fn collect(generator: JobGenerator) -> Vec<Job> {
        let (tx, mut rx) = mpsc::channel(1000);
        generator.run(&tx).await.unwrap();
        drop(tx);
        let mut jobs = Vec::new();
        while let Some(job) = rx.recv().await {
            jobs.push(job);
        }
        jobs
    }

    #[tokio::test]
    async fn brute_emits_the_cartesian_product_with_extensions() {
        let first = wordlist("a\nb");
        let second = wordlist("c\nd");
        let generator = JobGenerator::new(&options(&[&first, &second], &[".txt", ".php"], false), 0.0);
        let jobs = collect(generator).await;
        assert_eq!(jobs.len(), 8);
        for pair in [("a", "c"), ("a", "d"), ("b", "c"), ("b", "d")] {
            for ext in [".txt", ".php"] {
                let expected = vec![format!("{}{ext}", pair.0), format!("{}{ext}", pair.1)];
                assert!(jobs.contains(&expected), "missing {expected:?}");
            }
        }
    }

    #[tokio::test]
    async fn combo_walks_wordlists_in_lockstep() {
        let first = wordlist("a\nb");
        let second = wordlist("c\nd");
        let generator = JobGenerator::new(&options(&[&first, &second], &[""], true), 0.0);
        let jobs = collect(generator).await;
        assert_eq!(jobs, vec![vec!["a", "c"], vec!["b", "d"]]);
    }

    #[tokio::test]
    async fn combo_stops_at_the_shortest_wordlist() {
        let first = wordlist("a\nb\nc");
        let second = wordlist("x");
        let generator = JobGenerator::new(&options(&[&first, &second], &[""], true), 0.0);
        let jobs = collect(generator).await;
        assert_eq!(jobs, vec![vec!["a", "x"]]);
    }

    #[tokio::test]
    async fn combo_treats_a_blank_line_as_end_of_input() {
        let first = wordlist("a\n\nc");
        let generator = JobGenerator::new(&options(&[&first], &[""], true), 0.0);
        let jobs = collect(generator).await;
        assert_eq!(jobs, vec![vec!["a"]]);
    }

    #[tokio::test]
    async fn extensions_apply_to_every_position() {
        let first = wordlist("user");
        let second = wordlist("pass");
        let generator = JobGenerator::new(&options(&[&first, &second], &[".bak"], false), 0.0);
        let jobs = collect(generator).await;
        assert_eq!(jobs, vec![vec!["user.bak", "pass.bak"]]);
    }

    #[tokio::test]
    async fn empty_extension_list_emits_tuples_verbatim() {
        let first = wordlist("admin");
        let generator = JobGenerator::new(&options(&[&first], &[], false), 0.0);
        let jobs = collect(generator).await;
        assert_eq!(jobs, vec![vec!["admin"]]);
    }

    #[tokio::test]
    async fn job_counts_match_generation() {
        let first = wordlist("a\nb");
        let second = wordlist("c\nd\ne");
        let files = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        let exts = vec![".txt".to_string(), String::new()];
        assert_eq!(count_jobs(&files, false, &exts).await.unwrap(), 12);
        assert_eq!(count_jobs(&files, true, &exts).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn empty_wordlist_is_a_setup_error() {
        let empty = wordlist("");
        let files = vec![empty.path().to_path_buf()];
        let err = count_jobs(&files, false, &[String::new()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("empty file"));
    }
}
