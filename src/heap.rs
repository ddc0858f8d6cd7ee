use crate::sizeclass::*;
use std::sync::Arc;

// Recovering erased type information for live heap objects. The runtime keeps
// only a per-word pointer bitmap per scannable span; we compare that bitmap
// against the pointer layout of every type whose size lands in the span's size
// class. The result is a superset of the true answer: structurally identical
// types can't be told apart.

// Span metadata for the span containing some address. For small allocations
// `size` is one of CLASS_TO_SIZE; for large ones it's a page multiple.
// noscan spans have no bitmap at all.
#[derive(Clone, Copy, Debug)]
pub struct SpanInfo {
    pub size: i64,
    pub noscan: bool,
}

// The process image (live process or core dump) this crate inspects. Span
// lookup, the mark bitmap, and object-start resolution all live behind it.
pub trait HeapSource {
    fn ptr_size(&self) -> u64;
    // Span metadata for the span containing addr, or None if addr is outside the heap.
    fn find_heap_info(&self, addr: u64) -> Option<SpanInfo>;
    // Whether the runtime's mark bitmap has the pointer bit set for the word at addr.
    // Always false within noscan spans.
    fn is_ptr(&self, addr: u64, ptr_size: u64) -> bool;
    // Resolve addr to (object start, offset within object), or (0, 0) if not on the heap.
    fn find_object(&self, addr: u64) -> (u64, u64);
}

// Pointer layout of one target-runtime type. ptr_bytes == 0 means the type
// holds no pointers anywhere.
pub struct TypeDescriptor {
    pub name: String,
    pub size: i64,
    pub ptr_bytes: i64,
    ptr_mask: Vec<u64>, // bit per pointer-sized word
}

impl TypeDescriptor {
    pub fn new(name: String, size: i64, ptr_words: &[usize], ptr_size: u64) -> Self {
        let words = if size > 0 {(size as u64 + ptr_size - 1) / ptr_size} else {0};
        let mut mask = vec![0u64; ((words + 63) / 64) as usize];
        let mut ptr_bytes = 0i64;
        for &w in ptr_words {
            assert!((w as u64) < words, "pointer word {} outside type of {} bytes", w, size);
            mask[w / 64] |= 1u64 << (w % 64);
            ptr_bytes = ptr_bytes.max((w as i64 + 1) * ptr_size as i64);
        }
        TypeDescriptor {name, size, ptr_bytes, ptr_mask: mask}
    }

    pub fn is_ptr(&self, word: usize) -> bool {
        match self.ptr_mask.get(word / 64) {
            Some(bits) => bits & 1u64 << (word % 64) != 0,
            None => false,
        }
    }
}

// Candidate types bucketed by span class, built once during process-image
// analysis and read-shared afterwards.
pub struct TypeIndex {
    buckets: Vec<Vec<Arc<TypeDescriptor>>>,
}

#[derive(Default)]
pub struct MatchResult {
    pub single: Vec<Arc<TypeDescriptor>>,
    pub array: Vec<Arc<TypeDescriptor>>,
}

impl TypeIndex {
    pub fn new() -> Self {
        TypeIndex {buckets: (0..NUM_SPAN_CLASSES).map(|_| Vec::new()).collect()}
    }

    // Bucket a type under the span class its allocations would land in.
    // Types above MAX_SMALL_SIZE get dedicated spans and aren't indexed.
    pub fn insert(&mut self, ty: Arc<TypeDescriptor>) {
        let noscan = ty.ptr_bytes == 0;
        if let Some(sc) = span_class(ty.size, noscan) {
            self.buckets[sc as usize].push(ty);
        }
    }

    pub fn bucket(&self, span_class: u8) -> &[Arc<TypeDescriptor>] {
        &self.buckets[span_class as usize]
    }

    // Enumerate every type whose bitmap layout is compatible with the object
    // containing addr, as a single value and as an array element.
    pub fn match_check(&self, heap: &dyn HeapSource, addr: u64) -> MatchResult {
        let mut result = MatchResult::default();
        let (obj, off0) = heap.find_object(addr);
        if obj == 0 && off0 == 0 {
            return result;
        }
        let span = match heap.find_heap_info(obj) {
            Some(s) => s,
            None => return result,
        };
        // noscan means no bitmap info, nothing to compare against.
        if span.noscan {
            return result;
        }
        if let Some(sc) = span_class(span.size, false) {
            for ty in self.bucket(sc) {
                if single_type_match(heap, obj, ty) {
                    result.single.push(ty.clone());
                }
                if array_type_match(heap, obj, ty) {
                    result.array.push(ty.clone());
                }
            }
        }
        result
    }
}

// Whether the object at obj could be a single value of type ty, judged by the
// span's pointer bitmap. obj must be an object start inside the heap.
pub fn single_type_match(heap: &dyn HeapSource, obj: u64, ty: &TypeDescriptor) -> bool {
    let ptr_size = heap.ptr_size();
    let span = match heap.find_heap_info(obj) {
        Some(s) => s,
        None => return false,
    };
    // The type must belong to the same size class as the span.
    if span.size != class_bytes(size_class(ty.size)) {
        return false;
    }
    // Without a bitmap on either side there's no positive evidence.
    if span.noscan || ty.ptr_bytes == 0 {
        return false;
    }
    let mut addr = obj;
    for index in 0..(span.size / ptr_size as i64) as usize {
        if heap.is_ptr(addr, ptr_size) != ty.is_ptr(index) {
            return false;
        }
        addr += ptr_size;
    }
    true
}

// Whether the object at obj could be an array of ty ([n]ty for n >= 2),
// i.e. the span holds floor(span/ty.size) copies of ty's bitmap plus a
// pointer-free tail.
pub fn array_type_match(heap: &dyn HeapSource, obj: u64, ty: &TypeDescriptor) -> bool {
    let ptr_size = heap.ptr_size();
    let span = match heap.find_heap_info(obj) {
        Some(s) => s,
        None => return false,
    };
    // A [1]ty is indistinguishable from ty; the single-type case covers it.
    if span.size <= 2 * ty.size {
        return false;
    }
    if span.noscan || ty.ptr_bytes == 0 {
        return false;
    }
    let num = span.size / ty.size;
    let tail = span.size % ty.size;
    // An array of this shape would have been allocated into a different span
    // class, so it can't be living here.
    if tail != 0 && size_class(span.size) != size_class(num * ty.size) {
        return false;
    }
    // Elements are assumed compact: bitmap repeats with period ty.size.
    let mut addr = obj;
    for _ in 0..num {
        for index in 0..(ty.size / ptr_size as i64) as usize {
            if heap.is_ptr(addr, ptr_size) != ty.is_ptr(index) {
                return false;
            }
            addr += ptr_size;
        }
    }
    // Tail padding must be pointer-free.
    for _ in 0..(tail / ptr_size as i64) {
        if heap.is_ptr(addr, ptr_size) {
            return false;
        }
        addr += ptr_size;
    }
    true
}

#[cfg(test)]
mod tests {
    use crate::heap::*;
    use crate::sizeclass::*;
    use rand::Rng;
    use std::sync::Arc;

    // One span at a fixed base, word-granular pointer bits.
    struct TestHeap {
        base: u64,
        span: SpanInfo,
        bits: Vec<bool>,
    }

    impl TestHeap {
        fn new(span_size: i64, noscan: bool, ptr_words: &[usize]) -> Self {
            let mut bits = vec![false; (span_size / 8) as usize];
            for &w in ptr_words {
                bits[w] = true;
            }
            TestHeap {base: 0x10000, span: SpanInfo {size: span_size, noscan}, bits}
        }
    }

    impl HeapSource for TestHeap {
        fn ptr_size(&self) -> u64 { 8 }
        fn find_heap_info(&self, addr: u64) -> Option<SpanInfo> {
            if addr >= self.base && addr < self.base + self.span.size as u64 {Some(self.span)} else {None}
        }
        fn is_ptr(&self, addr: u64, _ptr_size: u64) -> bool {
            if self.span.noscan || addr < self.base {
                return false;
            }
            self.bits.get(((addr - self.base) / 8) as usize).copied().unwrap_or(false)
        }
        fn find_object(&self, addr: u64) -> (u64, u64) {
            if addr >= self.base && addr < self.base + self.span.size as u64 {(self.base, addr - self.base)} else {(0, 0)}
        }
    }

    fn ty(name: &str, size: i64, ptr_words: &[usize]) -> TypeDescriptor {
        TypeDescriptor::new(name.to_string(), size, ptr_words, 8)
    }

    #[test]
    fn single_match_basic() {
        // 32-byte object, pointer in word 0: matches a {ptr, int, int, int} type.
        let heap = TestHeap::new(32, false, &[0]);
        assert!(single_type_match(&heap, heap.base, &ty("node", 32, &[0])));
        assert!(!single_type_match(&heap, heap.base, &ty("node2", 32, &[1])));
        assert!(!single_type_match(&heap, heap.base, &ty("node3", 32, &[0, 1])));
    }

    #[test]
    fn single_match_rejects_wrong_class() {
        // Span size 48, type size 32: rejected by the class check before any
        // bitmap is consulted.
        let heap = TestHeap::new(48, false, &[0]);
        assert!(!single_type_match(&heap, heap.base, &ty("t", 32, &[0])));
        // Same size class does proceed to the bitmap.
        assert!(single_type_match(&heap, heap.base, &ty("t48", 48, &[0])));
    }

    #[test]
    fn noscan_never_matches() {
        let heap = TestHeap::new(32, true, &[]);
        let t = ty("t", 32, &[0]);
        assert!(!single_type_match(&heap, heap.base, &t));
        assert!(!array_type_match(&heap, heap.base, &t));
        let mut index = TypeIndex::new();
        index.insert(Arc::new(ty("t", 32, &[0])));
        let r = index.match_check(&heap, heap.base + 8);
        assert!(r.single.is_empty() && r.array.is_empty());
    }

    #[test]
    fn pointer_free_type_never_matches() {
        let heap = TestHeap::new(32, false, &[0]);
        let t = ty("plain", 32, &[]);
        assert!(t.ptr_bytes == 0);
        assert!(!single_type_match(&heap, heap.base, &t));
        assert!(!array_type_match(&heap, heap.base, &t));
    }

    #[test]
    fn array_match_rejects_length_one() {
        // span 32, type 16: 2*16 == 32 is not < span, so no array match.
        let heap = TestHeap::new(32, false, &[0, 2]);
        assert!(!array_type_match(&heap, heap.base, &ty("pair", 16, &[0])));
    }

    #[test]
    fn array_match_three_elements() {
        // span 48 = 3 * 16, pointer in word 0 of each element.
        let heap = TestHeap::new(48, false, &[0, 2, 4]);
        let t = ty("pair", 16, &[0]);
        assert!(array_type_match(&heap, heap.base, &t));
        // Flip one element's bit and it no longer matches.
        let heap2 = TestHeap::new(48, false, &[0, 2, 5]);
        assert!(!array_type_match(&heap2, heap2.base, &t));
    }

    #[test]
    fn array_tail_must_be_pointer_free() {
        // span 80 (class 7), type 24: num=3, tail=8. Type words: [ptr, int, int].
        let t = ty("t24", 24, &[0]);
        let elems = [0usize, 3, 6];
        let heap = TestHeap::new(80, false, &elems);
        assert!(array_type_match(&heap, heap.base, &t));
        // A pointer bit in the tail word rejects.
        let heap2 = TestHeap::new(80, false, &[0, 3, 6, 9]);
        assert!(!array_type_match(&heap2, heap2.base, &t));
    }

    #[test]
    fn array_tail_class_consistency() {
        // span 80, type 36: num=2, tail=8, but 2*36=72 still classifies as 80,
        // so the consistency check passes and the bitmap decides.
        assert_eq!(class_bytes(size_class(72)), 80);
        // span 96 (class 8), type 40: num=2 -> 2*40=80 classifies as 80 != 96,
        // so an array of 40-byte elements can't live in a 96-byte span.
        let heap = TestHeap::new(96, false, &[0, 5]);
        assert!(!array_type_match(&heap, heap.base, &ty("t40", 40, &[0])));
    }

    #[test]
    fn match_check_off_heap_is_empty() {
        let heap = TestHeap::new(32, false, &[0]);
        let mut index = TypeIndex::new();
        index.insert(Arc::new(ty("t", 32, &[0])));
        let r = index.match_check(&heap, 0x999);
        assert!(r.single.is_empty() && r.array.is_empty());
    }

    #[test]
    fn match_check_single_and_array_share_bucket_order() {
        // span 48, bitmap 101010: matches {ptr,int}*3 as an array and any
        // 48-byte type with words 0,2,4 as a single.
        let heap = TestHeap::new(48, false, &[0, 2, 4]);
        let mut index = TypeIndex::new();
        index.insert(Arc::new(ty("whole", 48, &[0, 2, 4])));
        index.insert(Arc::new(ty("pair", 16, &[0])));
        index.insert(Arc::new(ty("other", 48, &[1])));
        let r = index.match_check(&heap, heap.base + 16);
        let singles: Vec<&str> = r.single.iter().map(|t| t.name.as_str()).collect();
        let arrays: Vec<&str> = r.array.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(singles, ["whole"]);
        // "pair" lives in the 16-byte bucket, so it's never consulted for a
        // 48-byte span even though its repeated bitmap would fit.
        assert!(arrays.is_empty());
        // A 48-byte span candidate that also repeats works for both lists.
        let mut index2 = TypeIndex::new();
        index2.insert(Arc::new(ty("tri", 48, &[0, 2, 4])));
        let r2 = index2.match_check(&heap, heap.base);
        assert_eq!(r2.single.len(), 1);
        assert!(r2.array.is_empty()); // 48 <= 2*48
    }

    #[test]
    fn randomized_array_roundtrip() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            // Element of 2..=4 words, replicated into a span of num >= 3 elements,
            // sized to an exact class so there's no tail.
            let elem_words = rng.gen_range(2..=4usize);
            let elem_size = (elem_words * 8) as i64;
            let mut ptr_words: Vec<usize> = (0..elem_words).filter(|_| rng.gen_bool(0.5)).collect();
            if ptr_words.is_empty() {
                ptr_words.push(rng.gen_range(0..elem_words));
            }
            // Pick a span that's an exact multiple with at least 3 elements.
            let span_size = match elem_size {
                16 => 48,
                24 => 96, // 4 * 24
                32 => 96, // 3 * 32
                _ => unreachable!(),
            };
            let num = (span_size / elem_size) as usize;
            let mut span_bits = Vec::new();
            for k in 0..num {
                for &w in &ptr_words {
                    span_bits.push(k * elem_words + w);
                }
            }
            let heap = TestHeap::new(span_size, false, &span_bits);
            let t = ty("elem", elem_size, &ptr_words);
            assert!(array_type_match(&heap, heap.base, &t), "span {} elem {} words {:?}", span_size, elem_size, ptr_words);
            // Perturb one word anywhere: the match must flip off.
            let flip = rng.gen_range(0..(span_size / 8) as usize);
            let mut bits2 = span_bits.clone();
            match bits2.iter().position(|&b| b == flip) {
                Some(i) => { bits2.remove(i); }
                None => bits2.push(flip),
            }
            let heap2 = TestHeap::new(span_size, false, &bits2);
            assert!(!array_type_match(&heap2, heap2.base, &t));
        }
    }
}
