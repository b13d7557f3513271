use crate::cell::PeriodicBox;
use crate::config;
use crate::error::OrderError;
use crate::hexatic::{DEFAULT_SYMMETRY, HexOrder};
use crate::neighbors::NeighborMode;
use crate::order::LocalQl;
use crate::positions::points_from_flat;
use nalgebra::Vector3;
use num_complex::Complex64;
use numpy::{PyArray1, PyArrayMethods, PyReadonlyArray2, PyUntypedArrayMethods};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use std::borrow::Cow;
use tracing::warn;

impl From<OrderError> for PyErr {
    fn from(err: OrderError) -> Self {
        PyValueError::new_err(err.to_string())
    }
}

#[pyclass(name = "Box")]
#[derive(Clone)]
pub struct PyBox {
    pub(crate) inner: PeriodicBox,
}

#[pymethods]
impl PyBox {
    #[new]
    #[pyo3(signature = (lx, ly, lz=0.0, xy=0.0, xz=0.0, yz=0.0, is_2d=false))]
    fn new(lx: f64, ly: f64, lz: f64, xy: f64, xz: f64, yz: f64, is_2d: bool) -> PyResult<Self> {
        let inner = if is_2d {
            if xy != 0.0 || xz != 0.0 || yz != 0.0 {
                return Err(PyValueError::new_err(
                    "Two-dimensional boxes do not support tilt factors",
                ));
            }
            PeriodicBox::rectangle(lx, ly)
        } else {
            PeriodicBox::triclinic(lx, ly, lz, xy, xz, yz)
        }
        .map_err(OrderError::from)?;
        Ok(PyBox { inner })
    }

    #[staticmethod]
    fn cube(l: f64) -> PyResult<Self> {
        let inner = PeriodicBox::cube(l).map_err(OrderError::from)?;
        Ok(PyBox { inner })
    }

    #[staticmethod]
    fn square(l: f64) -> PyResult<Self> {
        let inner = PeriodicBox::square(l).map_err(OrderError::from)?;
        Ok(PyBox { inner })
    }

    #[getter(Lx)]
    fn lx(&self) -> f64 {
        self.inner.lengths().x
    }

    #[getter(Ly)]
    fn ly(&self) -> f64 {
        self.inner.lengths().y
    }

    #[getter(Lz)]
    fn lz(&self) -> f64 {
        if self.inner.is_2d() {
            0.0
        } else {
            self.inner.lengths().z
        }
    }

    #[getter]
    fn volume(&self) -> f64 {
        self.inner.volume()
    }

    #[getter(is2D)]
    fn is_2d(&self) -> bool {
        self.inner.is_2d()
    }

    fn wrap(&self, point: [f64; 3]) -> [f64; 3] {
        let wrapped = self.inner.wrap(&Vector3::from(point));
        [wrapped.x, wrapped.y, wrapped.z]
    }

    fn __repr__(&self) -> String {
        let l = self.inner.lengths();
        let p = self.inner.pbc();
        format!(
            "Box(Lx={}, Ly={}, Lz={}, pbc=[{}, {}, {}], is2D={})",
            l.x,
            l.y,
            self.lz(),
            p.x,
            p.y,
            p.z,
            self.inner.is_2d()
        )
    }
}

/// Borrows contiguous `(N, 3)` arrays directly and copies everything else.
fn get_positions<'a>(points: &'a PyReadonlyArray2<'a, f64>) -> PyResult<Cow<'a, [Vector3<f64>]>> {
    let dim = points.shape()[1];
    if let Ok(slice) = points.as_slice() {
        if dim == 3
            && let Ok(cast_slice) = bytemuck::try_cast_slice(slice)
        {
            return Ok(Cow::Borrowed(cast_slice));
        }
        return Ok(Cow::Owned(points_from_flat(slice, dim)?));
    }

    // Fallback: copy in logical order
    let flat: Vec<f64> = points.as_array().iter().copied().collect();
    Ok(Cow::Owned(points_from_flat(&flat, dim)?))
}

fn degree_from(l: i64) -> Result<usize, OrderError> {
    usize::try_from(l).map_err(|_| OrderError::NegativeDegree(l))
}

fn to_numpy<'py>(py: Python<'py>, values: Option<&[f64]>) -> Option<Bound<'py, PyArray1<f64>>> {
    values.map(|v| PyArray1::from_slice(py, v))
}

#[pyclass(name = "LocalQl", subclass)]
pub struct PyLocalQl {
    pub(crate) inner: LocalQl,
}

impl PyLocalQl {
    fn build(cell: &PyBox, mode: NeighborMode, l: i64) -> PyResult<Self> {
        let degree = degree_from(l)?;
        let inner = LocalQl::new(cell.inner.clone(), mode, degree)?;
        Ok(PyLocalQl { inner })
    }

    fn run<'py, F>(
        &mut self,
        py: Python<'py>,
        points: PyReadonlyArray2<'py, f64>,
        op: F,
    ) -> PyResult<Bound<'py, PyArray1<f64>>>
    where
        F: for<'a> FnOnce(&'a mut LocalQl, &'a [Vector3<f64>]) -> Result<&'a [f64], OrderError>
            + Send,
    {
        let positions = get_positions(&points)?;
        let inner = &mut self.inner;
        let values = py.allow_threads(|| op(inner, &positions).map(<[f64]>::to_vec))?;
        Ok(PyArray1::from_vec(py, values))
    }
}

#[pymethods]
impl PyLocalQl {
    #[new]
    #[pyo3(signature = (box_, rmax, l))]
    fn new(box_: &PyBox, rmax: f64, l: i64) -> PyResult<Self> {
        Self::build(box_, NeighborMode::cutoff(rmax), l)
    }

    fn compute<'py>(
        &mut self,
        py: Python<'py>,
        points: PyReadonlyArray2<'py, f64>,
    ) -> PyResult<Bound<'py, PyArray1<f64>>> {
        self.run(py, points, LocalQl::compute)
    }

    #[pyo3(name = "computeAve")]
    fn compute_ave<'py>(
        &mut self,
        py: Python<'py>,
        points: PyReadonlyArray2<'py, f64>,
    ) -> PyResult<Bound<'py, PyArray1<f64>>> {
        self.run(py, points, LocalQl::compute_ave)
    }

    #[pyo3(name = "computeNorm")]
    fn compute_norm<'py>(
        &mut self,
        py: Python<'py>,
        points: PyReadonlyArray2<'py, f64>,
    ) -> PyResult<Bound<'py, PyArray1<f64>>> {
        self.run(py, points, LocalQl::compute_norm)
    }

    #[pyo3(name = "computeAveNorm")]
    fn compute_ave_norm<'py>(
        &mut self,
        py: Python<'py>,
        points: PyReadonlyArray2<'py, f64>,
    ) -> PyResult<Bound<'py, PyArray1<f64>>> {
        self.run(py, points, LocalQl::compute_ave_norm)
    }

    #[getter(Ql)]
    fn ql<'py>(&self, py: Python<'py>) -> Option<Bound<'py, PyArray1<f64>>> {
        to_numpy(py, self.inner.ql())
    }

    #[getter(ave_Ql)]
    fn ave_ql<'py>(&self, py: Python<'py>) -> Option<Bound<'py, PyArray1<f64>>> {
        to_numpy(py, self.inner.ave_ql())
    }

    #[getter(norm_Ql)]
    fn norm_ql<'py>(&self, py: Python<'py>) -> Option<Bound<'py, PyArray1<f64>>> {
        to_numpy(py, self.inner.norm_ql())
    }

    #[getter(ave_norm_Ql)]
    fn ave_norm_ql<'py>(&self, py: Python<'py>) -> Option<Bound<'py, PyArray1<f64>>> {
        to_numpy(py, self.inner.ave_norm_ql())
    }

    #[getter]
    fn l(&self) -> usize {
        self.inner.degree()
    }

    #[getter]
    fn num_particles(&self) -> usize {
        self.inner.num_particles()
    }

    #[getter]
    fn periodic_box(&self) -> PyBox {
        PyBox {
            inner: self.inner.periodic_box().clone(),
        }
    }

    #[getter]
    fn insufficient_neighbors(&self) -> Vec<usize> {
        self.inner.insufficient_neighbors()
    }
}

/// k-nearest-neighbor flavor; `rmax` only seeds the search grid.
#[pyclass(name = "LocalQlNear", extends = PyLocalQl)]
pub struct PyLocalQlNear;

#[pymethods]
impl PyLocalQlNear {
    #[new]
    #[pyo3(signature = (box_, rmax, l, kn=12))]
    fn new(box_: &PyBox, rmax: f64, l: i64, kn: usize) -> PyResult<(Self, PyLocalQl)> {
        let mode = NeighborMode::Nearest {
            k: kn,
            search_radius: Some(rmax),
        };
        Ok((PyLocalQlNear, PyLocalQl::build(box_, mode, l)?))
    }

    #[getter]
    fn kn(self_: PyRef<'_, Self>) -> usize {
        match self_.as_super().inner.neighbor_mode() {
            NeighborMode::Nearest { k, .. } => *k,
            NeighborMode::Cutoff { .. } => 0,
        }
    }
}

/// Planar k-atic order over the `k` nearest neighbors; `rmax` only seeds
/// the search grid.
#[pyclass(name = "HexOrderParameter")]
pub struct PyHexOrderParameter {
    inner: HexOrder,
}

#[pymethods]
impl PyHexOrderParameter {
    #[new]
    #[pyo3(signature = (box_, rmax, k=DEFAULT_SYMMETRY))]
    fn new(box_: &PyBox, rmax: f64, k: usize) -> PyResult<Self> {
        let inner = HexOrder::with_search_radius(box_.inner.clone(), rmax, k)?;
        Ok(PyHexOrderParameter { inner })
    }

    fn compute<'py>(
        &mut self,
        py: Python<'py>,
        points: PyReadonlyArray2<'py, f64>,
    ) -> PyResult<Bound<'py, PyArray1<Complex64>>> {
        let positions = get_positions(&points)?;
        let inner = &mut self.inner;
        let psi = py.allow_threads(|| inner.compute(&positions).map(<[Complex64]>::to_vec))?;
        Ok(PyArray1::from_vec(py, psi))
    }

    #[getter]
    fn psi<'py>(&self, py: Python<'py>) -> Option<Bound<'py, PyArray1<Complex64>>> {
        self.inner.psi().map(|v| PyArray1::from_slice(py, v))
    }

    #[getter]
    fn k(&self) -> usize {
        self.inner.k()
    }

    #[getter]
    fn num_particles(&self) -> usize {
        self.inner.num_particles()
    }

    #[getter]
    fn periodic_box(&self) -> PyBox {
        PyBox {
            inner: self.inner.periodic_box().clone(),
        }
    }

    #[getter]
    fn insufficient_neighbors(&self) -> Vec<usize> {
        self.inner.insufficient_neighbors()
    }
}

#[pyfunction]
fn get_num_threads() -> usize {
    rayon::current_num_threads()
}

/// Sizes the global rayon pool. Only possible before the pool is first used.
#[pyfunction]
fn set_num_threads(n: usize) -> PyResult<()> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(n)
        .build_global()
        .map_err(|err| {
            warn!(
                requested = n,
                current = rayon::current_num_threads(),
                %err,
                "thread pool already initialized"
            );
            PyRuntimeError::new_err(format!(
                "cannot set thread count to {n}: {err} (running with {} threads)",
                rayon::current_num_threads()
            ))
        })
}

#[pyfunction]
fn get_brute_force_threshold() -> usize {
    config::get_brute_force_threshold()
}

#[pyfunction]
fn set_brute_force_threshold(val: usize) {
    config::set_brute_force_threshold(val);
}

#[pyfunction]
fn get_parallel_threshold() -> usize {
    config::get_parallel_threshold()
}

#[pyfunction]
fn set_parallel_threshold(val: usize) {
    config::set_parallel_threshold(val);
}

#[pyfunction]
#[pyo3(name = "init_logging", signature = (level=None))]
fn py_init_logging(level: Option<String>) {
    crate::init_logging(level.as_deref());
}

#[pymodule]
fn steinhardt_rs(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyBox>()?;
    m.add_class::<PyLocalQl>()?;
    m.add_class::<PyLocalQlNear>()?;
    m.add_class::<PyHexOrderParameter>()?;
    m.add_function(wrap_pyfunction!(get_num_threads, m)?)?;
    m.add_function(wrap_pyfunction!(set_num_threads, m)?)?;
    m.add_function(wrap_pyfunction!(py_init_logging, m)?)?;
    m.add_function(wrap_pyfunction!(get_brute_force_threshold, m)?)?;
    m.add_function(wrap_pyfunction!(set_brute_force_threshold, m)?)?;
    m.add_function(wrap_pyfunction!(get_parallel_threshold, m)?)?;
    m.add_function(wrap_pyfunction!(set_parallel_threshold, m)?)?;
    Ok(())
}
