use std::collections::HashSet;

use crate::wire::{CourseIndex, FileDescriptor};

/// Separator the server uses to flatten sub-folders into a display name.
pub const DISPLAY_SEPARATOR: &str = " / ";

/// Category labels offered for filtering and for new contributions.
pub const CATEGORIES: [&str; 4] = ["历年真题", "复习笔记", "实验报告", "课后答案"];

/// Filter choices that mean "every category".
const ALL_CATEGORIES: [&str; 2] = ["all", "全部"];

/// Turns a user-chosen category label into a filter value; the "all" labels
/// and blank input disable category filtering.
pub fn category_filter(label: Option<&str>) -> Option<String> {
    let label = label?.trim();
    if label.is_empty() || ALL_CATEGORIES.iter().any(|all| label.eq_ignore_ascii_case(all)) {
        return None;
    }
    Some(label.to_string())
}

// -----------------------------------------------------------------------------
// Folder structure
// -----------------------------------------------------------------------------

/// A file placed in the tree; `file_name` is the last display segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeFile {
    pub file_name: String,
    pub descriptor: FileDescriptor,
}

/// Subfolders and files keep the order they were first seen in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderNode {
    pub name: String,
    pub files: Vec<TreeFile>,
    pub subfolders: Vec<FolderNode>,
}

impl FolderNode {
    pub fn new(name: impl Into<String>) -> Self {
        FolderNode {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Places `descriptor` below this node at the depth its display name
    /// implies, creating intermediate folders on the way.
    pub fn insert(&mut self, descriptor: &FileDescriptor) {
        let segments: Vec<&str> = descriptor.name.split(DISPLAY_SEPARATOR).collect();
        let (file_name, folders) = match segments.split_last() {
            Some(split) => split,
            None => return,
        };

        let mut node = self;
        for folder in folders {
            node = node.subfolder_mut(folder);
        }
        node.files.push(TreeFile {
            file_name: file_name.to_string(),
            descriptor: descriptor.clone(),
        });
    }

    fn subfolder_mut(&mut self, name: &str) -> &mut FolderNode {
        let pos = match self.subfolders.iter().position(|f| f.name == name) {
            Some(pos) => pos,
            None => {
                self.subfolders.push(FolderNode::new(name));
                self.subfolders.len() - 1
            }
        };
        &mut self.subfolders[pos]
    }

    pub fn child_count(&self) -> usize {
        self.files.len() + self.subfolders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.child_count() == 0
    }

    /// Display names of every file below this node, rebuilt from the folder
    /// chain. Subfolders come before files, as in rendering.
    #[cfg(test)]
    pub fn flatten(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.flatten_into(&mut Vec::new(), &mut out);
        out
    }

    #[cfg(test)]
    fn flatten_into<'a>(&'a self, prefix: &mut Vec<&'a str>, out: &mut Vec<String>) {
        for sub in &self.subfolders {
            prefix.push(&sub.name);
            sub.flatten_into(prefix, out);
            prefix.pop();
        }
        for file in &self.files {
            let mut parts = prefix.clone();
            parts.push(&file.file_name);
            out.push(parts.join(DISPLAY_SEPARATOR));
        }
    }
}

pub fn build_course_tree(course: &str, files: &[FileDescriptor]) -> FolderNode {
    let mut root = FolderNode::new(course);
    for file in files {
        root.insert(file);
    }
    root
}

/// One tree per course, in the given course order.
pub fn build_forest(courses: &[(String, Vec<FileDescriptor>)]) -> Vec<FolderNode> {
    courses
        .iter()
        .map(|(course, files)| build_course_tree(course, files))
        .collect()
}

// -----------------------------------------------------------------------------
// Search, category filter, sort
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Default,
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Default)]
pub struct Filter {
    /// Case-insensitive substring matched against course and file names.
    pub query: String,
    /// Substring the display name must contain; `None` keeps every category.
    pub category: Option<String>,
    /// Applies to course names only.
    pub sort: SortOrder,
}

impl Filter {
    /// Filters before any tree is built; courses left without files are
    /// dropped.
    pub fn apply(&self, index: &CourseIndex) -> Vec<(String, Vec<FileDescriptor>)> {
        let query = self.query.trim().to_lowercase();

        let mut courses: Vec<(String, Vec<FileDescriptor>)> = index
            .iter()
            .map(|(course, files)| {
                let course_hit = course.to_lowercase().contains(&query);
                let kept = files
                    .iter()
                    .filter(|f| {
                        query.is_empty() || course_hit || f.name.to_lowercase().contains(&query)
                    })
                    .filter(|f| match &self.category {
                        Some(cat) => f.name.contains(cat.as_str()),
                        None => true,
                    })
                    .cloned()
                    .collect::<Vec<_>>();
                (course.clone(), kept)
            })
            .filter(|(_, files)| !files.is_empty())
            .collect();

        match self.sort {
            SortOrder::Default => {}
            SortOrder::Ascending => courses.sort_by(|a, b| a.0.cmp(&b.0)),
            SortOrder::Descending => courses.sort_by(|a, b| b.0.cmp(&a.0)),
        }

        courses
    }
}

// -----------------------------------------------------------------------------
// Expand/collapse
// -----------------------------------------------------------------------------

/// Open folders, keyed by cumulative path (`course/sub/subsub`).
#[derive(Debug, Clone, Default)]
pub struct ExpandState {
    open: HashSet<String>,
}

impl ExpandState {
    pub fn is_open(&self, path: &str) -> bool {
        self.open.contains(path)
    }

    pub fn toggle(&mut self, path: &str) {
        let path = path.trim_matches('/');
        if !self.open.remove(path) {
            self.open.insert(path.to_string());
        }
    }

    pub fn open(&mut self, path: &str) {
        self.open.insert(path.trim_matches('/').to_string());
    }

    pub fn expand_all(&mut self, forest: &[FolderNode]) {
        fn walk(node: &FolderNode, path: String, open: &mut HashSet<String>) {
            for sub in &node.subfolders {
                walk(sub, format!("{}/{}", path, sub.name), open);
            }
            open.insert(path);
        }
        for root in forest {
            walk(root, root.name.clone(), &mut self.open);
        }
    }
}

// -----------------------------------------------------------------------------
// File kinds
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Document,
    Image,
    Code,
    Spreadsheet,
    Presentation,
    Archive,
    Video,
    Audio,
    Other,
}

impl FileKind {
    pub fn from_name(name: &str) -> Self {
        let ext = match name.rsplit_once('.') {
            Some((_, ext)) => ext.to_lowercase(),
            None => return FileKind::Other,
        };

        match ext.as_str() {
            "pdf" | "doc" | "docx" | "txt" | "md" => FileKind::Document,
            "jpg" | "jpeg" | "png" | "gif" | "svg" | "webp" | "bmp" => FileKind::Image,
            "js" | "jsx" | "ts" | "tsx" | "py" | "java" | "cpp" | "c" | "rs" | "html" | "css"
            | "json" => FileKind::Code,
            "xls" | "xlsx" | "csv" => FileKind::Spreadsheet,
            "ppt" | "pptx" => FileKind::Presentation,
            "zip" | "rar" | "7z" | "tar" | "gz" => FileKind::Archive,
            "mp4" | "avi" | "mkv" | "mov" | "wmv" => FileKind::Video,
            "mp3" | "wav" | "flac" | "aac" => FileKind::Audio,
            _ => FileKind::Other,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FileKind::Document => "doc",
            FileKind::Image => "img",
            FileKind::Code => "code",
            FileKind::Spreadsheet => "sheet",
            FileKind::Presentation => "slides",
            FileKind::Archive => "archive",
            FileKind::Video => "video",
            FileKind::Audio => "audio",
            FileKind::Other => "file",
        }
    }
}

// -----------------------------------------------------------------------------
// View state + rendering
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewState {
    Loading,
    Failed(String),
    /// Loaded, but nothing matched (or nothing exists).
    Empty,
    Ready(Vec<FolderNode>),
}

impl ViewState {
    pub fn from_listing(listing: anyhow::Result<CourseIndex>, filter: &Filter) -> Self {
        match listing {
            Ok(index) => {
                let forest = build_forest(&filter.apply(&index));
                if forest.is_empty() {
                    ViewState::Empty
                } else {
                    ViewState::Ready(forest)
                }
            }
            Err(e) => ViewState::Failed(e.to_string()),
        }
    }

    pub fn render(&self, expand: &ExpandState) -> Vec<String> {
        match self {
            ViewState::Loading => vec!["loading resources...".to_string()],
            ViewState::Failed(msg) => vec![format!("could not load resources: {}", msg)],
            ViewState::Empty => vec!["no matching files".to_string()],
            ViewState::Ready(forest) => render_forest(forest, expand),
        }
    }
}

pub fn render_forest(forest: &[FolderNode], expand: &ExpandState) -> Vec<String> {
    let mut lines = Vec::new();
    for root in forest {
        render_node(root, &root.name, 0, expand, &mut lines);
    }
    lines
}

fn render_node(
    node: &FolderNode,
    path: &str,
    level: usize,
    expand: &ExpandState,
    lines: &mut Vec<String>,
) {
    let indent = "  ".repeat(level);
    let open = expand.is_open(path);
    let marker = if node.is_empty() {
        " "
    } else if open {
        "v"
    } else {
        ">"
    };
    lines.push(format!(
        "{}{} {}/ ({})",
        indent,
        marker,
        node.name,
        node.child_count()
    ));

    if !open {
        return;
    }

    for sub in &node.subfolders {
        render_node(sub, &format!("{}/{}", path, sub.name), level + 1, expand, lines);
    }

    let file_indent = "  ".repeat(level + 1);
    for file in &node.files {
        lines.push(format!(
            "{}  {} [{}] {}  {}",
            file_indent,
            file.file_name,
            FileKind::from_name(&file.file_name).label(),
            file.descriptor.size,
            file.descriptor.path
        ));
    }
}
