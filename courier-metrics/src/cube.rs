use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

/// Error returned by [`MultidimensionalCube`] lookups.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum CubeError {
    /// The dimension at `level` already holds the maximum number of distinct values.
    #[error("too many distinct values for dimension {level}")]
    DimensionValuesCountLimitReached {
        /// Zero-based index of the dimension.
        level: usize,
    },
    /// The cube already holds the maximum number of points.
    #[error("total points limit reached")]
    TotalPointsLimitReached,
    /// The point does not exist and was not created.
    #[error("point does not exist")]
    PointDoesNotExist,
    /// The number of coordinates does not match the number of dimensions.
    #[error("expected {expected} coordinates, got {actual}")]
    DimensionCountMismatch {
        /// Number of dimensions of the cube.
        expected: usize,
        /// Number of coordinates passed.
        actual: usize,
    },
}

/// A point returned from [`MultidimensionalCube::try_get_or_create_point`].
#[derive(Debug)]
pub struct PointResult<P> {
    /// The point at the requested coordinates.
    pub point: Arc<P>,
    /// `true` if this call created the point.
    pub created_new: bool,
}

/// Distinct values seen at one dimension, bounded by a limit.
///
/// Every value counts the points using it plus the creations in flight. A value whose count drops
/// to zero is removed and frees its slot.
struct LevelValues {
    limit: usize,
    values: RwLock<HashMap<String, usize>>,
}

impl LevelValues {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            values: RwLock::new(HashMap::new()),
        }
    }

    fn try_reserve(&self, value: &str) -> bool {
        let mut values = self.values.write();
        if let Some(users) = values.get_mut(value) {
            *users += 1;
            return true;
        }
        if values.len() >= self.limit {
            return false;
        }

        values.insert(value.to_owned(), 1);
        true
    }

    fn release(&self, value: &str) {
        let mut values = self.values.write();
        if let Some(users) = values.get_mut(value) {
            *users -= 1;
            if *users == 0 {
                values.remove(value);
            }
        }
    }
}

struct Branch<P> {
    branches: RwLock<HashMap<String, Arc<Branch<P>>>>,
    points: RwLock<HashMap<String, Arc<P>>>,
}

impl<P> Branch<P> {
    fn new() -> Self {
        Self {
            branches: RwLock::new(HashMap::new()),
            points: RwLock::new(HashMap::new()),
        }
    }

    fn get_branch(&self, key: &str) -> Option<Arc<Branch<P>>> {
        self.branches.read().get(key).cloned()
    }

    fn get_or_create_branch(&self, key: &str) -> Arc<Branch<P>> {
        if let Some(branch) = self.get_branch(key) {
            return branch;
        }

        self.branches
            .write()
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Branch::new()))
            .clone()
    }
}

/// A thread-safe map from coordinate vectors to lazily created points.
///
/// The cube is a trie with one level per dimension. Both the number of distinct values per
/// dimension and the total number of points are bounded. Capacity is reserved before a point is
/// constructed, and no lock is held while the point factory runs. If a concurrent writer inserts
/// the same point first, the reservation is returned and the existing point is used.
pub struct MultidimensionalCube<P> {
    levels: Vec<LevelValues>,
    total_points_limit: usize,
    total_points: AtomicUsize,
    root: Branch<P>,
}

impl<P> MultidimensionalCube<P> {
    /// Creates a cube with one entry in `values_per_dimension_limits` per dimension.
    pub fn new(total_points_limit: usize, values_per_dimension_limits: &[usize]) -> Self {
        Self {
            levels: values_per_dimension_limits
                .iter()
                .map(|&limit| LevelValues::new(limit))
                .collect(),
            total_points_limit,
            total_points: AtomicUsize::new(0),
            root: Branch::new(),
        }
    }

    /// Returns the number of dimensions.
    pub fn dimensions_count(&self) -> usize {
        self.levels.len()
    }

    /// Returns the maximum number of points.
    pub fn total_points_limit(&self) -> usize {
        self.total_points_limit
    }

    /// Returns the number of points currently in the cube.
    pub fn total_points_count(&self) -> usize {
        self.total_points.load(Ordering::Acquire)
    }

    /// Returns the distinct values accepted so far at the given dimension.
    pub fn dimension_values(&self, level: usize) -> Vec<String> {
        match self.levels.get(level) {
            Some(level) => {
                let mut values: Vec<_> = level.values.read().keys().cloned().collect();
                values.sort();
                values
            }
            None => Vec::new(),
        }
    }

    fn check_coordinates(&self, coordinates: &[&str]) -> Result<(), CubeError> {
        if coordinates.len() != self.levels.len() {
            return Err(CubeError::DimensionCountMismatch {
                expected: self.levels.len(),
                actual: coordinates.len(),
            });
        }
        Ok(())
    }

    /// Splits coordinates into the branch path and the point key.
    ///
    /// A zero-dimensional cube keeps its only point under the empty key of the root.
    fn split<'c>(coordinates: &'c [&'c str]) -> (&'c [&'c str], &'c str) {
        match coordinates.split_last() {
            Some((last, path)) => (path, last),
            None => (&[], ""),
        }
    }

    /// Looks up an existing point.
    pub fn try_get_point(&self, coordinates: &[&str]) -> Result<Arc<P>, CubeError> {
        self.check_coordinates(coordinates)?;

        let (path, key) = Self::split(coordinates);
        let mut branch = None::<Arc<Branch<P>>>;
        for value in path {
            let current = branch.as_deref().unwrap_or(&self.root);
            branch = Some(current.get_branch(value).ok_or(CubeError::PointDoesNotExist)?);
        }

        let branch = branch.as_deref().unwrap_or(&self.root);
        branch
            .points
            .read()
            .get(key)
            .cloned()
            .ok_or(CubeError::PointDoesNotExist)
    }

    /// Returns the point at `coordinates`, creating it with `create` if it does not exist yet.
    pub fn try_get_or_create_point<F>(
        &self,
        coordinates: &[&str],
        create: F,
    ) -> Result<PointResult<P>, CubeError>
    where
        F: FnOnce(&[&str]) -> Arc<P>,
    {
        match self.try_get_point(coordinates) {
            Ok(point) => {
                return Ok(PointResult {
                    point,
                    created_new: false,
                });
            }
            Err(CubeError::PointDoesNotExist) => (),
            Err(error) => return Err(error),
        }

        for (level, value) in coordinates.iter().enumerate() {
            if !self.levels[level].try_reserve(value) {
                self.release_levels(&coordinates[..level]);
                return Err(CubeError::DimensionValuesCountLimitReached { level });
            }
        }

        let reserved = self.total_points.fetch_add(1, Ordering::AcqRel);
        if reserved >= self.total_points_limit {
            self.total_points.fetch_sub(1, Ordering::AcqRel);
            self.release_levels(coordinates);
            return Err(CubeError::TotalPointsLimitReached);
        }

        let (path, key) = Self::split(coordinates);
        let mut branch = None::<Arc<Branch<P>>>;
        for value in path {
            let current = branch.as_deref().unwrap_or(&self.root);
            branch = Some(current.get_or_create_branch(value));
        }
        let branch = branch.as_deref().unwrap_or(&self.root);

        // Construct the point without holding any lock.
        let candidate = create(coordinates);

        let mut points = branch.points.write();
        if let Some(existing) = points.get(key) {
            let existing = existing.clone();
            drop(points);

            self.total_points.fetch_sub(1, Ordering::AcqRel);
            self.release_levels(coordinates);
            return Ok(PointResult {
                point: existing,
                created_new: false,
            });
        }

        points.insert(key.to_owned(), candidate.clone());
        Ok(PointResult {
            point: candidate,
            created_new: true,
        })
    }

    /// Returns the dimension values reserved for a creation that did not happen.
    fn release_levels(&self, coordinates: &[&str]) {
        for (level, value) in self.levels.iter().zip(coordinates) {
            level.release(value);
        }
    }

    /// Returns all points together with their coordinates.
    pub fn get_all_points(&self) -> Vec<(Vec<String>, Arc<P>)> {
        let mut out = Vec::new();
        let depth = self.levels.len();
        collect_points(&self.root, depth, &mut Vec::new(), &mut out);
        out
    }
}

fn collect_points<P>(
    branch: &Branch<P>,
    remaining: usize,
    prefix: &mut Vec<String>,
    out: &mut Vec<(Vec<String>, Arc<P>)>,
) {
    if remaining <= 1 {
        for (key, point) in branch.points.read().iter() {
            let mut coordinates = prefix.clone();
            if remaining == 1 {
                coordinates.push(key.clone());
            }
            out.push((coordinates, point.clone()));
        }
        return;
    }

    let branches: Vec<_> = branch
        .branches
        .read()
        .iter()
        .map(|(key, branch)| (key.clone(), branch.clone()))
        .collect();

    for (key, child) in branches {
        prefix.push(key);
        collect_points(&child, remaining - 1, prefix, out);
        prefix.pop();
    }
}

impl<P> fmt::Debug for MultidimensionalCube<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultidimensionalCube")
            .field("dimensions", &self.levels.len())
            .field("total_points", &self.total_points_count())
            .field("total_points_limit", &self.total_points_limit)
            .finish()
    }
}
