//! Split list parsing
//!
//! A split directory holds `classInd.txt` (`<index> <ClassName>` per line),
//! `trainlist<split>.txt` and `testlist<split>.txt`
//! (`<ClassName>/v_<Video>.avi [label]` per line). A list line without a
//! label takes it from the class index.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::info;

use crate::config::DatasetKind;
use crate::error::{Error, Result};
use crate::training::aggregation::GroundTruthIndex;

/// Class names by their index in `classInd.txt`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassIndex {
    by_name: HashMap<String, i64>,
}

impl ClassIndex {
    pub fn parse(contents: &str) -> Result<Self> {
        let mut by_name = HashMap::new();
        for (line_no, line) in non_empty_lines(contents) {
            let mut parts = line.split_whitespace();
            let (Some(index), Some(name)) = (parts.next(), parts.next()) else {
                return Err(Error::data(format!(
                    "class index line {}: expected '<index> <name>', got '{}'",
                    line_no, line
                )));
            };
            let index: i64 = index.parse().map_err(|_| {
                Error::data(format!("class index line {}: '{}' is not an integer", line_no, index))
            })?;
            by_name.insert(name.to_string(), index);
        }
        Ok(Self { by_name })
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn index_of(&self, class_name: &str) -> Option<i64> {
        self.by_name.get(class_name).copied()
    }
}

/// One video of a split list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoEntry {
    /// Video id without the `v_` prefix and extension
    pub video: String,
    /// Class directory name
    pub class_name: String,
    /// Label as written in the split files, before any indexing adjustment
    pub raw_label: i64,
}

impl VideoEntry {
    /// Zero-based label under the dataset's indexing convention
    pub fn label(&self, zero_indexed: bool) -> i64 {
        if zero_indexed {
            self.raw_label
        } else {
            self.raw_label - 1
        }
    }
}

/// Parse a train or test list
pub fn parse_video_list(contents: &str, classes: &ClassIndex) -> Result<Vec<VideoEntry>> {
    non_empty_lines(contents)
        .map(|(line_no, line)| parse_list_line(line_no, line, classes))
        .collect()
}

fn parse_list_line(line_no: usize, line: &str, classes: &ClassIndex) -> Result<VideoEntry> {
    let mut parts = line.split_whitespace();
    let path = parts
        .next()
        .ok_or_else(|| Error::data(format!("split line {} is empty", line_no)))?;

    let (class_name, file_name) = path.split_once('/').ok_or_else(|| {
        Error::data(format!(
            "split line {}: expected '<Class>/<video file>', got '{}'",
            line_no, path
        ))
    })?;
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::data(format!("split line {}: bad file name '{}'", line_no, file_name)))?;
    let video = stem.strip_prefix("v_").unwrap_or(stem).to_string();

    let raw_label = match parts.next() {
        Some(label) => label.parse().map_err(|_| {
            Error::data(format!("split line {}: label '{}' is not an integer", line_no, label))
        })?,
        None => classes.index_of(class_name).ok_or_else(|| {
            Error::data(format!(
                "split line {}: class '{}' is not in the class index",
                line_no, class_name
            ))
        })?,
    };

    Ok(VideoEntry {
        video,
        class_name: class_name.to_string(),
        raw_label,
    })
}

fn non_empty_lines(contents: &str) -> impl Iterator<Item = (usize, &str)> {
    contents
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty())
}

/// Class index, training and validation videos of one split
#[derive(Debug, Clone)]
pub struct SplitLists {
    pub dataset: DatasetKind,
    pub classes: ClassIndex,
    pub train: Vec<VideoEntry>,
    pub test: Vec<VideoEntry>,
}

impl SplitLists {
    /// Read `classInd.txt`, `trainlist<split>.txt` and `testlist<split>.txt`
    pub fn load(split_dir: &Path, split: &str, dataset: DatasetKind) -> Result<Self> {
        let read = |name: String| {
            let path = split_dir.join(&name);
            fs::read_to_string(&path)
                .map_err(|e| Error::data(format!("cannot read {}: {}", path.display(), e)))
        };

        let classes = ClassIndex::parse(&read("classInd.txt".to_string())?)?;
        let train = parse_video_list(&read(format!("trainlist{}.txt", split))?, &classes)?;
        let test = parse_video_list(&read(format!("testlist{}.txt", split))?, &classes)?;

        info!(
            dataset = %dataset,
            split,
            classes = classes.len(),
            train_videos = train.len(),
            test_videos = test.len(),
            "Loaded split lists"
        );
        Ok(Self {
            dataset,
            classes,
            train,
            test,
        })
    }

    /// Video-level ground truth of the validation videos
    pub fn ground_truth(&self) -> GroundTruthIndex {
        self.test
            .iter()
            .map(|entry| (entry.video.clone(), entry.raw_label.to_string()))
            .collect()
    }
}
