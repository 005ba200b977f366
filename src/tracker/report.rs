use std::collections::BTreeMap;
use std::fmt;

use log::{info, warn};

/// Resource categories in the order a drain releases them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    Library,
    Socket,
    File,
    CriticalSection,
    HeapObject,
    Heap,
    VirtualMemory,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Library,
        Category::Socket,
        Category::File,
        Category::CriticalSection,
        Category::HeapObject,
        Category::Heap,
        Category::VirtualMemory,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Category::Library => "library",
            Category::Socket => "socket",
            Category::File => "file",
            Category::CriticalSection => "critical section",
            Category::HeapObject => "heap object",
            Category::Heap => "heap block",
            Category::VirtualMemory => "virtual memory",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SiteLeaks {
    pub site: u32,
    pub count: usize,
    pub bytes: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CategoryLeaks {
    pub count: usize,
    pub bytes: u64,
    /// One bucket per attributing call site, by ascending address.
    pub sites: Vec<SiteLeaks>,
}

static NO_LEAKS: CategoryLeaks = CategoryLeaks { count: 0, bytes: 0, sites: Vec::new() };

impl CategoryLeaks {
    fn add(&mut self, site: u32, bytes: u64) {
        self.count += 1;
        self.bytes += bytes;
        match self.sites.binary_search_by_key(&site, |s| s.site) {
            Ok(i) => {
                self.sites[i].count += 1;
                self.sites[i].bytes += bytes;
            }
            Err(i) => self.sites.insert(i, SiteLeaks { site, count: 1, bytes }),
        }
    }
}

/// What a module still held when it was unloaded.
#[derive(Clone, Debug, Default)]
pub struct LeakReport {
    pub module: String,
    categories: BTreeMap<Category, CategoryLeaks>,
    /// Releases that failed inside the fault boundary.
    pub failures: usize,
    /// Dummy stubs freed; loader-owned, so not counted as leaks.
    pub stubs_freed: usize,
}

impl LeakReport {
    pub fn new(module: &str) -> LeakReport {
        LeakReport { module: module.to_owned(), ..LeakReport::default() }
    }

    pub fn record(&mut self, category: Category, site: u32, bytes: u64) {
        self.categories.entry(category).or_default().add(site, bytes);
    }

    pub fn category(&self, category: Category) -> &CategoryLeaks {
        self.categories.get(&category).unwrap_or(&NO_LEAKS)
    }

    pub fn total_count(&self) -> usize {
        self.categories.values().map(|c| c.count).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.categories.values().map(|c| c.bytes).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.total_count() == 0
    }

    pub fn log(&self) {
        if self.is_clean() {
            info!("[+] {} unloaded without leaks", self.module);
            return;
        }
        for (category, leaks) in &self.categories {
            warn!(
                "[-] {} leaked {} {}(s), {} bytes, from {} call site(s)",
                self.module,
                leaks.count,
                category,
                leaks.bytes,
                leaks.sites.len()
            );
            for site in &leaks.sites {
                warn!("    0x{:08x}: {} x, {} bytes", site.site, site.count, site.bytes);
            }
        }
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}: {} leaked resource(s), {} bytes", self.module, self.total_count(), self.total_bytes())?;
        for (category, leaks) in &self.categories {
            writeln!(f, "  {:<16} {:>5} {:>10} bytes", category.name(), leaks.count, leaks.bytes)?;
            for site in &leaks.sites {
                writeln!(f, "    0x{:08x} {:>5} {:>10} bytes", site.site, site.count, site.bytes)?;
            }
        }
        if self.failures > 0 {
            writeln!(f, "  {} release(s) failed", self.failures)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_by_call_site() {
        let mut report = LeakReport::new("z.dll");
        report.record(Category::Heap, 0x1000_1010, 10);
        report.record(Category::Heap, 0x1000_1010, 20);
        report.record(Category::Heap, 0x1000_1030, 30);
        report.record(Category::Heap, 0x1000_1020, 40);

        let heap = report.category(Category::Heap);
        assert_eq!(heap.count, 4);
        assert_eq!(heap.bytes, 100);
        let sites: Vec<(u32, u64)> = heap.sites.iter().map(|s| (s.site, s.bytes)).collect();
        assert_eq!(sites, vec![(0x1000_1010, 30), (0x1000_1020, 40), (0x1000_1030, 30)]);
        assert_eq!(report.category(Category::Socket).count, 0);
        assert!(!report.is_clean());
    }
}
