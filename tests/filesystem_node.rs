use std::{collections::HashMap, path::Path, time::SystemTime};

/// Simple in-memory representation of a file or folder (including any
/// children), to use for testing.
#[derive(Debug, Clone)]
pub enum FilesystemNode {
    Folder {
        // Use map rather than Vec, so that comparison of FilesystemNodes doesn't depend on order of children.
        children: HashMap<String, FilesystemNode>,
    },
    File {
        contents: Vec<u8>,
        modified: SystemTime,
    },
}

// Equality deliberately ignores modification times: the server assigns its
// own timestamps on upload, so only structure and contents are comparable
// across replicas.
impl PartialEq for FilesystemNode {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FilesystemNode::File { contents: a, .. }, FilesystemNode::File { contents: b, .. }) => a == b,
            (FilesystemNode::Folder { children: a }, FilesystemNode::Folder { children: b }) => a == b,
            _ => false,
        }
    }
}
impl Eq for FilesystemNode {}

/// Macro to ergonomically create a folder with a list of children.
/// Works by forwarding to the map! macro (see map-macro crate) to get the
/// HashMap of children, then forwarding that to the `folder` function.
#[macro_export]
macro_rules! folder {
    ($($tts:tt)*) => {
        folder(map! { $($tts)* })
    }
}

pub fn folder(children: HashMap<&str, FilesystemNode>) -> FilesystemNode {
    // Convert to a map with owned Strings (rather than &str). We take &strs in the param
    // to make the test code simpler.
    let children: HashMap<String, FilesystemNode> = children.into_iter().map(|(n, c)| (n.to_string(), c)).collect();
    FilesystemNode::Folder { children }
}

pub fn empty_folder() -> FilesystemNode {
    FilesystemNode::Folder { children: HashMap::new() }
}

pub fn file(contents: &str) -> FilesystemNode {
    FilesystemNode::File { contents: contents.as_bytes().to_vec(), modified: SystemTime::now() }
}

pub fn file_with_modified(contents: &str, modified: SystemTime) -> FilesystemNode {
    FilesystemNode::File { contents: contents.as_bytes().to_vec(), modified }
}

/// Mirrors the given file/folder and its descendants onto disk, at the given path.
pub fn save_filesystem_node_to_disk(node: &FilesystemNode, path: &Path) {
    if std::fs::symlink_metadata(path).is_ok() {
        panic!("Already exists!");
    }
    match node {
        FilesystemNode::File { contents, modified } => {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
            filetime::set_file_mtime(path, filetime::FileTime::from_system_time(*modified)).unwrap();
        }
        FilesystemNode::Folder { children } => {
            std::fs::create_dir_all(path).unwrap();
            for (child_name, child) in children {
                save_filesystem_node_to_disk(child, &path.join(child_name));
            }
        }
    }
}

/// Creates an in-memory representation of the file/folder and its
/// descendants at the given path. Returns None if the path doesn't point
/// to anything.
pub fn load_filesystem_node_from_disk(path: &Path) -> Option<FilesystemNode> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(_) => return None, // Non-existent
    };

    if metadata.file_type().is_file() {
        Some(FilesystemNode::File {
            contents: std::fs::read(path).unwrap(),
            modified: metadata.modified().unwrap(),
        })
    } else if metadata.file_type().is_dir() {
        let mut children = HashMap::<String, FilesystemNode>::new();
        for entry in std::fs::read_dir(path).unwrap() {
            let entry = entry.unwrap();
            let name = entry.file_name().to_str().unwrap().to_string();
            children.insert(name.clone(), load_filesystem_node_from_disk(&path.join(&name)).unwrap());
        }
        Some(FilesystemNode::Folder { children })
    } else {
        panic!("Unknown file type");
    }
}
