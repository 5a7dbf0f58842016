//! Shared fixtures: a recording platform, an in-memory filesystem and a
//! stub ELF loader speaking a tiny flat image format.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use kernel::elf::{ElfInfo, ElfLoader, ExecError};
use kernel::fs::{Vfs, VfsNode};
use kernel::memory::address_space::AddressSpace;
use kernel::memory::layout::align_up;
use kernel::memory::vm_object::VmObject;
use kernel::platform::{IpiTarget, IpiVector, Platform};
use kernel::process::Process;
use kernel::syscall::errno::Errno;
use kernel::x86_64::VirtAddr;
use kernel::{Kernel, KernelConfig};

pub const ELF_MAGIC: &[u8] = b"\x7fELF";
pub const IMAGE_BASE: u64 = 0x40_0000;

pub struct RecordingPlatform {
    ipis: Mutex<Vec<(IpiTarget, IpiVector)>>,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        RecordingPlatform {
            ipis: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<(IpiTarget, IpiVector)> {
        self.ipis.lock().unwrap().clone()
    }
}

impl Platform for RecordingPlatform {
    fn send_ipi(&self, target: IpiTarget, vector: IpiVector) {
        self.ipis.lock().unwrap().push((target, vector));
    }
}

pub struct MemNode {
    data: Mutex<Vec<u8>>,
}

impl VfsNode for MemNode {
    fn size(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, Errno> {
        let data = self.data.lock().unwrap();
        if offset >= data.len() {
            return Ok(0);
        }
        let len = buf.len().min(data.len() - offset);
        buf[..len].copy_from_slice(&data[offset..offset + len]);
        Ok(len)
    }

    fn write(&self, offset: usize, bytes: &[u8]) -> Result<usize, Errno> {
        let mut data = self.data.lock().unwrap();
        if offset + bytes.len() > data.len() {
            data.resize(offset + bytes.len(), 0);
        }
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(bytes.len())
    }
}

pub struct MemVfs {
    files: Mutex<BTreeMap<String, Arc<MemNode>>>,
}

impl MemVfs {
    pub fn new() -> Self {
        MemVfs {
            files: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn add(&self, path: &str, contents: &[u8]) {
        self.files.lock().unwrap().insert(
            path.to_string(),
            Arc::new(MemNode {
                data: Mutex::new(contents.to_vec()),
            }),
        );
    }
}

impl Vfs for MemVfs {
    fn resolve(&self, path: &str) -> Option<Arc<dyn VfsNode>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .map(|node| node as Arc<dyn VfsNode>)
    }
}

/// Flat test image: magic, optional interpreter marker, payload
pub fn make_image(payload: &[u8], with_interpreter: bool) -> Vec<u8> {
    let mut image = ELF_MAGIC.to_vec();
    if with_interpreter {
        image.extend_from_slice(b"INTERP");
    }
    image.extend_from_slice(payload);
    image
}

/// Loader for the flat test format: the whole image becomes one eagerly
/// allocated region, entered at its base.
pub struct TestElfLoader;

impl ElfLoader for TestElfLoader {
    fn verify(&self, image: &[u8]) -> bool {
        image.len() >= ELF_MAGIC.len() && image[..ELF_MAGIC.len()] == *ELF_MAGIC
    }

    fn load_segments(
        &self,
        space: &AddressSpace,
        image: &[u8],
        base: VirtAddr,
    ) -> Result<ElfInfo, ExecError> {
        if !self.verify(image) {
            return Err(ExecError::InvalidImage);
        }
        let base = if base.as_u64() == 0 {
            VirtAddr::new(IMAGE_BASE)
        } else {
            base
        };
        let size = align_up(image.len().max(1) as u64, 0x1000) as usize;
        let object = Arc::new(VmObject::prefilled(
            space.page_map().arena().clone(),
            size,
        )?);
        space.map_object(object, Some(base), true)?;
        space.write_user(base, image)?;

        let wants_linker = image.windows(6).any(|w| w == b"INTERP");
        Ok(ElfInfo {
            entry: base,
            phdr_vaddr: base.as_u64() + 0x40,
            ph_entry_size: 56,
            ph_count: 1,
            linker_path: wants_linker.then(|| "/lib/ld.so".to_string()),
        })
    }
}

pub struct Boot {
    pub platform: Arc<RecordingPlatform>,
    pub vfs: Arc<MemVfs>,
    pub kernel: Kernel,
}

pub fn boot(cpus: usize) -> Boot {
    let platform = Arc::new(RecordingPlatform::new());
    let vfs = Arc::new(MemVfs::new());
    vfs.add("/dev/null", b"");
    vfs.add("/dev/kernellog", b"");
    let kernel = Kernel::new(
        KernelConfig {
            cpus,
            memory_frames: 8192,
        },
        platform.clone(),
        vfs.clone(),
        Arc::new(TestElfLoader),
    )
    .unwrap();
    Boot {
        platform,
        vfs,
        kernel,
    }
}

/// Create a user process from a fresh flat image
pub fn spawn_user(kernel: &Kernel, name: &str) -> Arc<Process> {
    let image = make_image(b"payload", false);
    kernel
        .create_elf_process(&image, &[name.to_string()], &[], Some("/bin/app"), None)
        .unwrap()
}

/// Drive `cpu` until the process's main thread is its current thread
pub fn make_current(kernel: &Kernel, cpu: usize, process: &Arc<Process>) {
    let target = process.main_thread();
    for _ in 0..64 {
        if let Some(current) = kernel.sched().current_thread(cpu) {
            if Arc::ptr_eq(&current, &target) {
                return;
            }
            current.zero_time_slice();
        }
        kernel.sched().schedule(cpu);
    }
    panic!("process never became current on cpu {}", cpu);
}
