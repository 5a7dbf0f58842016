//! Filesystem interface
//!
//! The filesystem proper is an external collaborator; the kernel consumes
//! this narrow surface for stdio setup and ELF image loading. Open files
//! are kernel objects, so they enter the handle table uniformly.

use alloc::sync::Arc;
use spin::Mutex;

use crate::object::{KernelObject, KoClass};
use crate::syscall::errno::Errno;

/// A resolved filesystem node
pub trait VfsNode: Send + Sync {
    fn size(&self) -> usize;
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, Errno>;
    fn write(&self, offset: usize, data: &[u8]) -> Result<usize, Errno>;
}

/// Path resolution, the only namespace operation the kernel needs
pub trait Vfs: Send + Sync {
    fn resolve(&self, path: &str) -> Option<Arc<dyn VfsNode>>;
}

/// An open file: a node plus a position, reference-counted through the
/// handle table.
pub struct FileObject {
    node: Arc<dyn VfsNode>,
    position: Mutex<usize>,
}

/// Open a node, as the filesystem's `Open` would
pub fn open(node: Arc<dyn VfsNode>) -> Arc<FileObject> {
    Arc::new(FileObject {
        node,
        position: Mutex::new(0),
    })
}

impl FileObject {
    pub fn node(&self) -> &Arc<dyn VfsNode> {
        &self.node
    }

    pub fn position(&self) -> usize {
        *self.position.lock()
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        let mut position = self.position.lock();
        let read = self.node.read(*position, buf)?;
        *position += read;
        Ok(read)
    }

    pub fn write(&self, data: &[u8]) -> Result<usize, Errno> {
        let mut position = self.position.lock();
        let written = self.node.write(*position, data)?;
        *position += written;
        Ok(written)
    }
}

impl KernelObject for FileObject {
    fn class(&self) -> KoClass {
        KoClass::File
    }
}

/// Read a whole node into memory (ELF images, the dynamic linker)
pub fn read_all(node: &Arc<dyn VfsNode>) -> Result<alloc::vec::Vec<u8>, Errno> {
    let mut data = alloc::vec![0u8; node.size()];
    let mut done = 0;
    while done < data.len() {
        let read = node.read(done, &mut data[done..])?;
        if read == 0 {
            break;
        }
        done += read;
    }
    data.truncate(done);
    Ok(data)
}

/// Filesystem with nothing in it; stdio setup degrades to warnings
pub struct NullVfs;

impl Vfs for NullVfs {
    fn resolve(&self, _path: &str) -> Option<Arc<dyn VfsNode>> {
        None
    }
}
