// CUDA kernel source: compiled to PTX at device creation via NVRTC
//
// One compilation unit holds every kernel. Names are
//
//   {op}_forward_{dtype}    y  = f(x)
//   {op}_backward_{dtype}   dx = dy * f'(x, y)
//   axpy_{dtype}            y += alpha * x
//
// with op in relu, sigmoid, tanh, bnll, absval and dtype in f32, f64. Each
// thread handles one element; launch with `launch_cfg(n)`.
//
// The formulas mirror `NeuronOp::forward` / `NeuronOp::backward` on the host,
// including the +0 selection in ReLU and the BNLL clamp.

pub const MODULE_NAME: &str = "caffeine";

pub const KERNEL_SOURCE: &str = r#"
#define BNLL_THRESHOLD 50.0

#define NEURON_KERNELS(T, S, EXP, LOG, TANH, FABS)                                        \
extern "C" __global__ void relu_forward_##S(const T* x, T* y, T slope, unsigned int n) {   \
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;                                 \
    if (i < n) {                                                                            \
        T v = x[i];                                                                         \
        y[i] = v > (T)0 ? v : (slope == (T)0 ? (T)0 : v * slope);                           \
    }                                                                                       \
}                                                                                           \
extern "C" __global__ void relu_backward_##S(const T* x, const T* dy, T* dx, T slope,      \
                                             unsigned int n) {                              \
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;                                 \
    if (i < n) dx[i] = x[i] > (T)0 ? dy[i] : dy[i] * slope;                                 \
}                                                                                           \
extern "C" __global__ void sigmoid_forward_##S(const T* x, T* y, unsigned int n) {         \
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;                                 \
    if (i < n) y[i] = (T)1 / ((T)1 + EXP(-x[i]));                                           \
}                                                                                           \
extern "C" __global__ void sigmoid_backward_##S(const T* y, const T* dy, T* dx,            \
                                                unsigned int n) {                           \
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;                                 \
    if (i < n) dx[i] = dy[i] * y[i] * ((T)1 - y[i]);                                        \
}                                                                                           \
extern "C" __global__ void tanh_forward_##S(const T* x, T* y, unsigned int n) {            \
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;                                 \
    if (i < n) y[i] = TANH(x[i]);                                                           \
}                                                                                           \
extern "C" __global__ void tanh_backward_##S(const T* y, const T* dy, T* dx,               \
                                             unsigned int n) {                              \
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;                                 \
    if (i < n) dx[i] = dy[i] * ((T)1 - y[i] * y[i]);                                        \
}                                                                                           \
extern "C" __global__ void bnll_forward_##S(const T* x, T* y, unsigned int n) {            \
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;                                 \
    if (i < n) {                                                                            \
        T v = x[i];                                                                         \
        y[i] = v > (T)0 ? v + LOG((T)1 + EXP(-v)) : LOG((T)1 + EXP(v));                     \
    }                                                                                       \
}                                                                                           \
extern "C" __global__ void bnll_backward_##S(const T* x, const T* dy, T* dx,               \
                                             unsigned int n) {                              \
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;                                 \
    if (i < n) {                                                                            \
        T v = x[i] < (T)BNLL_THRESHOLD ? x[i] : (T)BNLL_THRESHOLD;                          \
        T e = EXP(v);                                                                       \
        dx[i] = dy[i] * e / (e + (T)1);                                                     \
    }                                                                                       \
}                                                                                           \
extern "C" __global__ void absval_forward_##S(const T* x, T* y, unsigned int n) {          \
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;                                 \
    if (i < n) y[i] = FABS(x[i]);                                                           \
}                                                                                           \
extern "C" __global__ void absval_backward_##S(const T* x, const T* dy, T* dx,             \
                                               unsigned int n) {                            \
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;                                 \
    if (i < n) {                                                                            \
        T v = x[i];                                                                         \
        T sign = v > (T)0 ? (T)1 : (v < (T)0 ? (T)-1 : (T)0);                               \
        dx[i] = dy[i] * sign;                                                               \
    }                                                                                       \
}                                                                                           \
extern "C" __global__ void axpy_##S(T alpha, const T* x, T* y, unsigned int n) {          \
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;                                 \
    if (i < n) y[i] += alpha * x[i];                                                        \
}

NEURON_KERNELS(float, f32, expf, logf, tanhf, fabsf)
NEURON_KERNELS(double, f64, exp, log, tanh, fabs)
"#;

pub const KERNEL_NAMES: &[&str] = &[
    "relu_forward_f32",
    "relu_backward_f32",
    "sigmoid_forward_f32",
    "sigmoid_backward_f32",
    "tanh_forward_f32",
    "tanh_backward_f32",
    "bnll_forward_f32",
    "bnll_backward_f32",
    "absval_forward_f32",
    "absval_backward_f32",
    "axpy_f32",
    "relu_forward_f64",
    "relu_backward_f64",
    "sigmoid_forward_f64",
    "sigmoid_backward_f64",
    "tanh_forward_f64",
    "tanh_backward_f64",
    "bnll_forward_f64",
    "bnll_backward_f64",
    "absval_forward_f64",
    "absval_backward_f64",
    "axpy_f64",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_listed_kernel_is_generated() {
        for name in KERNEL_NAMES {
            let (stem, suffix) = name.rsplit_once('_').unwrap();
            assert!(suffix == "f32" || suffix == "f64", "{name}");
            assert!(
                KERNEL_SOURCE.contains(&format!("void {stem}_##S(")),
                "{name} has no template"
            );
        }
    }
}
