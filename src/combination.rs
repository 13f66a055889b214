use serde::{Deserialize, Serialize};

/// Block stride giving roughly `block_operations` combinations per block: ceil(ops^(1/order)).
pub fn auto_stride(block_operations: usize, order: usize) -> usize {
    if order == 0 || block_operations <= 1 {
        return 1;
    }
    let exponent = order as u32;
    let mut stride = (block_operations as f64).powf(1.0 / order as f64).ceil() as usize;
    stride = stride.max(1);
    // float rounding can land one off either way
    while stride > 1 && (stride - 1).saturating_pow(exponent) >= block_operations {
        stride -= 1;
    }
    while stride.saturating_pow(exponent) < block_operations {
        stride += 1;
    }
    stride
}

pub fn num_blocks(num_variants: usize, stride: usize) -> usize {
    num_variants.div_ceil(stride.max(1))
}

/// Number of `order`-subsets of `n` variants, saturating at u64::MAX
pub fn binomial(n: usize, order: usize) -> u64 {
    if order > n {
        return 0;
    }
    let k = order.min(n - order) as u128;
    let mut result: u128 = 1;
    for i in 0..k {
        result = result * (n as u128 - i) / (i + 1);
        if result > u64::MAX as u128 {
            return u64::MAX;
        }
    }
    result as u64
}

/// Walks non-decreasing block coordinates (b0 <= b1 <= ... ) in lexicographic order.
///
/// The cursor carries no state besides the current coordinates, so it can be started at
/// any block with `starting_at`.
#[derive(Clone, Debug)]
pub struct BlockCursor {
    coords: Vec<usize>,
    num_blocks: usize,
    done: bool,
}

impl BlockCursor {
    pub fn new(order: usize, num_blocks: usize) -> BlockCursor {
        BlockCursor {
            coords: vec![0; order],
            num_blocks,
            done: order == 0 || num_blocks == 0,
        }
    }

    pub fn starting_at(coords: Vec<usize>, num_blocks: usize) -> BlockCursor {
        let valid = !coords.is_empty()
            && coords.windows(2).all(|w| w[0] <= w[1])
            && coords.iter().all(|&b| b < num_blocks);
        BlockCursor {
            coords,
            num_blocks,
            done: !valid,
        }
    }

    fn advance(&mut self) {
        let last = self.num_blocks - 1;
        let mut i = self.coords.len();
        while i > 0 && self.coords[i - 1] == last {
            i -= 1;
        }
        if i == 0 {
            self.done = true;
            return;
        }
        let next = self.coords[i - 1] + 1;
        for b in self.coords[i - 1..].iter_mut() {
            *b = next;
        }
    }
}

impl Iterator for BlockCursor {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if self.done {
            return None;
        }
        let current = self.coords.clone();
        self.advance();
        Some(current)
    }
}

/// Every block coordinate of the search, in enumeration order.
pub fn all_block_coordinates(order: usize, num_blocks: usize) -> Vec<Vec<usize>> {
    BlockCursor::new(order, num_blocks).collect()
}

/// Strictly increasing combinations whose i-th member falls in block `block[i]`.
///
/// Lending cursor: `next_combination` hands out a view over an internal buffer that is
/// overwritten on the following call.
pub struct BlockCombinations {
    lo: Vec<usize>,
    hi: Vec<usize>,
    current: Vec<usize>,
    started: bool,
    done: bool,
}

impl BlockCombinations {
    pub fn new(block: &[usize], stride: usize, num_variants: usize) -> BlockCombinations {
        let lo: Vec<usize> = block
            .iter()
            .map(|&b| b.saturating_mul(stride).min(num_variants))
            .collect();
        let hi: Vec<usize> = block
            .iter()
            .map(|&b| (b + 1).saturating_mul(stride).min(num_variants))
            .collect();
        BlockCombinations {
            current: vec![0; block.len()],
            lo,
            hi,
            started: false,
            done: block.is_empty(),
        }
    }

    /// Sets positions `from..` to their smallest legal values, `current[from]` being `value`.
    fn fill_from(&mut self, from: usize, value: usize) -> bool {
        for j in from..self.current.len() {
            let v = if j == from {
                value.max(self.lo[j])
            } else {
                self.lo[j].max(self.current[j - 1] + 1)
            };
            self.current[j] = v;
            if v >= self.hi[j] {
                return false;
            }
        }
        true
    }

    pub fn next_combination(&mut self) -> Option<&[usize]> {
        if self.done {
            return None;
        }
        let found = if !self.started {
            self.started = true;
            self.fill_from(0, self.lo[0])
        } else {
            let mut found = false;
            for i in (0..self.current.len()).rev() {
                if self.fill_from(i, self.current[i] + 1) {
                    found = true;
                    break;
                }
            }
            found
        };
        if found {
            Some(self.current.as_slice())
        } else {
            self.done = true;
            None
        }
    }

    pub fn collect_all(mut self) -> Vec<Vec<usize>> {
        let mut all = Vec::new();
        while let Some(c) = self.next_combination() {
            all.push(c.to_vec());
        }
        all
    }
}

/// The 3^order joint genotypes in odometer order over {0,1,2}.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GenotypeTable {
    order: usize,
    cells: Vec<u8>,
}

impl GenotypeTable {
    pub fn new(order: usize) -> GenotypeTable {
        let num_cells = 3usize.pow(order as u32);
        let mut cells = Vec::with_capacity(num_cells * order);
        let mut digits = vec![0u8; order];
        for _ in 0..num_cells {
            cells.extend_from_slice(&digits);
            for d in digits.iter_mut().rev() {
                if *d < 2 {
                    *d += 1;
                    break;
                }
                *d = 0;
            }
        }
        GenotypeTable { order, cells }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn len(&self) -> usize {
        if self.order == 0 {
            0
        } else {
            self.cells.len() / self.order
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cell(&self, index: usize) -> &[u8] {
        &self.cells[index * self.order..(index + 1) * self.order]
    }

    /// Index of a joint genotype: sum of g_j * 3^(order-1-j)
    pub fn cell_index(genotypes: &[u8]) -> usize {
        genotypes.iter().fold(0, |acc, &g| acc * 3 + g as usize)
    }
}
