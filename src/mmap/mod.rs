pub mod mmap_file;
