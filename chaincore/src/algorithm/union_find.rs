use std::cmp::Ordering;

/// Arena union-find over dense indices `0..n` with path halving and union by size.
#[derive(Clone, Debug)]
pub struct Dsu {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl Dsu {
    #[inline]
    pub fn new(n: usize) -> Self {
        Self { parent: (0..n).collect(), size: vec![1; n] }
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    /// Root of `x`, halving the path on the way up.
    #[inline]
    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            let grandparent = self.parent[self.parent[x]];
            self.parent[x] = grandparent;
            x = grandparent;
        }
        x
    }

    /// Returns `true` if `a` and `b` were in different sets.
    ///
    /// The larger set absorbs the smaller one; on equal sizes the lower root survives.
    #[inline]
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        let (keep, absorbed) = match self.size[ra].cmp(&self.size[rb]) {
            Ordering::Greater => (ra, rb),
            Ordering::Less => (rb, ra),
            Ordering::Equal => (ra.min(rb), ra.max(rb)),
        };
        self.parent[absorbed] = keep;
        self.size[keep] += self.size[absorbed];
        true
    }

    #[inline]
    pub fn same(&mut self, a: usize, b: usize) -> bool {
        self.find(a) == self.find(b)
    }

    /// Size of the set containing `x`.
    pub fn set_size(&mut self, x: usize) -> usize {
        let r = self.find(x);
        self.size[r]
    }

    /// Components as ascending index lists, ordered by their smallest index.
    pub fn groups(mut self) -> Vec<Vec<usize>> {
        let n = self.parent.len();
        // slot of each root in the output, assigned on first encounter
        let mut slot = vec![usize::MAX; n];
        let mut out: Vec<Vec<usize>> = Vec::new();
        for i in 0..n {
            let r = self.find(i);
            if slot[r] == usize::MAX {
                slot[r] = out.len();
                out.push(Vec::with_capacity(self.size[r]));
            }
            out[slot[r]].push(i);
        }
        out
    }
}
